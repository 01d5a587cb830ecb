//! Payload codec
//!
//! The session layer treats every value stream as opaque bytes; this module
//! defines the pluggable codec that turns [`Value`] trees into those bytes
//! and back, consulting a reference resolver at each object boundary.
//!
//! During encoding, any object value is replaced by its identifier. The
//! first encounter of an identifier within one payload also carries the
//! class name and a property snapshot so the receiving side can populate a
//! fresh proxy; later encounters are bare references, which is what keeps
//! cyclic object graphs finite on the wire. During decoding, an identifier
//! is replaced by a resolved or newly admitted local object, and the
//! resolver is handed the pending proxies for population when the top-level
//! value is complete.
//!
//! The default codec is JSON. Object references are spelled as maps with a
//! `$dto` key; map keys beginning with `$` are reserved by the codec.

use crate::error::{Error, Result};
use crate::value::{ObjectRef, Value};
use bytes::Bytes;
use objex_wire::ObjectId;
use std::collections::{BTreeMap, HashSet};
use tracing::warn;

const REF_KEY: &str = "$dto";
const CLASS_KEY: &str = "$class";
const STATE_KEY: &str = "$state";

/// Encode-side resolver hooks.
pub trait EncodeRefs: Send + Sync {
    /// Identifier for an object value; the server side assigns one here on
    /// first serialization.
    fn reference_for(&self, obj: &ObjectRef) -> Result<ObjectId>;

    /// Class name and property snapshot sent with the first encounter of an
    /// identifier. `None` means reference-only (the client side never sends
    /// state).
    fn introduction(&self, obj: &ObjectRef) -> Result<Option<(String, Vec<(String, Value)>)>>;
}

/// Decode-side resolver hooks.
pub trait DecodeRefs: Send + Sync {
    /// Resolve or admit the local object for an incoming identifier.
    /// `None` means the identifier is unknown here; the codec substitutes
    /// null.
    fn admit(
        &self,
        id: ObjectId,
        class: Option<&str>,
        state: Option<BTreeMap<String, Value>>,
    ) -> Result<Option<ObjectRef>>;
}

/// A payload serialization strategy.
pub trait PayloadCodec: Send + Sync {
    fn encode(&self, value: &Value, refs: &dyn EncodeRefs) -> Result<Bytes>;
    fn decode(&self, data: &[u8], refs: &dyn DecodeRefs) -> Result<Value>;
}

/// JSON payload codec.
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode(&self, value: &Value, refs: &dyn EncodeRefs) -> Result<Bytes> {
        let mut seen = HashSet::new();
        let json = encode_value(value, refs, &mut seen)?;
        let raw = serde_json::to_vec(&json).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(Bytes::from(raw))
    }

    fn decode(&self, data: &[u8], refs: &dyn DecodeRefs) -> Result<Value> {
        if data.is_empty() {
            return Ok(Value::Null);
        }
        let json: serde_json::Value =
            serde_json::from_slice(data).map_err(|e| Error::Codec(e.to_string()))?;
        decode_value(&json, refs)
    }
}

fn encode_value(
    value: &Value,
    refs: &dyn EncodeRefs,
    seen: &mut HashSet<ObjectId>,
) -> Result<serde_json::Value> {
    use serde_json::Value as Json;

    Ok(match value {
        Value::Null => Json::Null,
        Value::Bool(b) => Json::Bool(*b),
        Value::Int(n) => Json::from(*n),
        Value::Float(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| Error::Codec(format!("non-finite float {n}")))?,
        Value::Str(s) => Json::String(s.clone()),
        Value::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_value(item, refs, seen)?);
            }
            Json::Array(out)
        }
        Value::Map(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, entry) in entries {
                if key.starts_with('$') {
                    return Err(Error::Codec(format!("map key {key:?} is reserved")));
                }
                out.insert(key.clone(), encode_value(entry, refs, seen)?);
            }
            Json::Object(out)
        }
        Value::Object(obj) => {
            let id = refs.reference_for(obj)?;
            let mut out = serde_json::Map::new();
            out.insert(REF_KEY.to_string(), Json::String(id.to_string()));

            if seen.insert(id) {
                if let Some((class, state)) = refs.introduction(obj)? {
                    let mut encoded_state = serde_json::Map::with_capacity(state.len());
                    for (name, entry) in &state {
                        encoded_state.insert(name.clone(), encode_value(entry, refs, seen)?);
                    }
                    out.insert(CLASS_KEY.to_string(), Json::String(class));
                    out.insert(STATE_KEY.to_string(), Json::Object(encoded_state));
                }
            }
            Json::Object(out)
        }
    })
}

fn decode_value(json: &serde_json::Value, refs: &dyn DecodeRefs) -> Result<Value> {
    use serde_json::Value as Json;

    Ok(match json {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        Json::String(s) => Value::Str(s.clone()),
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_value(item, refs)?);
            }
            Value::List(out)
        }
        Json::Object(map) if map.contains_key(REF_KEY) => {
            let id_text = map
                .get(REF_KEY)
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Codec("object reference id is not a string".to_string()))?;
            let id = ObjectId::parse(id_text).map_err(|e| Error::Codec(e.to_string()))?;

            let class = map.get(CLASS_KEY).and_then(|v| v.as_str());

            // Decode state before admitting, so child objects are admitted
            // first and population applies bottom-up.
            let state = match map.get(STATE_KEY) {
                Some(Json::Object(entries)) => {
                    let mut out = BTreeMap::new();
                    for (name, entry) in entries {
                        out.insert(name.clone(), decode_value(entry, refs)?);
                    }
                    Some(out)
                }
                Some(other) => {
                    return Err(Error::Codec(format!(
                        "object state must be a map, got {other}"
                    )))
                }
                None => None,
            };

            match refs.admit(id, class, state)? {
                Some(obj) => Value::Object(obj),
                None => {
                    warn!(%id, "reference to unknown object, substituting null");
                    Value::Null
                }
            }
        }
        Json::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, entry) in map {
                out.insert(key.clone(), decode_value(entry, refs)?);
            }
            Value::Map(out)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;
    use crate::host::{DtoCore, HostObject};
    use std::any::Any;
    use std::sync::{Arc, Mutex};

    struct Leaf {
        core: DtoCore,
        class: Arc<crate::class::ClassDescriptor>,
    }

    impl Leaf {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: DtoCore::new(),
                class: ClassBuilder::<Leaf>::new("Leaf")
                    .getter("Kind", |_| Ok(Value::from("leaf")))
                    .build(),
            })
        }
    }

    impl HostObject for Leaf {
        fn core(&self) -> &DtoCore {
            &self.core
        }
        fn class(&self) -> &Arc<crate::class::ClassDescriptor> {
            &self.class
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Encode-side double: assigns ids and snapshots through the class.
    struct TestEncodeRefs;

    impl EncodeRefs for TestEncodeRefs {
        fn reference_for(&self, obj: &ObjectRef) -> Result<ObjectId> {
            match obj {
                ObjectRef::Host(host) => Ok(host.core().assign_id(ObjectId::generate())),
                ObjectRef::Remote(proxy) => Ok(proxy.id()),
            }
        }

        fn introduction(
            &self,
            obj: &ObjectRef,
        ) -> Result<Option<(String, Vec<(String, Value)>)>> {
            match obj {
                ObjectRef::Host(host) => {
                    let state = host.class().snapshot(host.as_any())?;
                    Ok(Some((host.class().name().to_string(), state)))
                }
                ObjectRef::Remote(_) => Ok(None),
            }
        }
    }

    /// Decode-side double: records admissions, resolves nothing.
    struct TestDecodeRefs {
        admitted: Mutex<Vec<(ObjectId, Option<String>)>>,
        known: Option<(ObjectId, Arc<Leaf>)>,
    }

    impl DecodeRefs for TestDecodeRefs {
        fn admit(
            &self,
            id: ObjectId,
            class: Option<&str>,
            _state: Option<BTreeMap<String, Value>>,
        ) -> Result<Option<ObjectRef>> {
            self.admitted
                .lock()
                .unwrap()
                .push((id, class.map(str::to_string)));
            match &self.known {
                Some((known_id, obj)) if *known_id == id => {
                    Ok(Some(ObjectRef::Host(obj.clone())))
                }
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn test_plain_data_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), Value::Int(3));
        map.insert("s".to_string(), Value::from("hi"));
        let value = Value::List(vec![Value::Null, Value::Bool(true), Value::Map(map)]);

        let encoded = JsonCodec.encode(&value, &TestEncodeRefs).unwrap();
        let refs = TestDecodeRefs {
            admitted: Mutex::new(Vec::new()),
            known: None,
        };
        let decoded = JsonCodec.decode(&encoded, &refs).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_empty_payload_is_null() {
        let refs = TestDecodeRefs {
            admitted: Mutex::new(Vec::new()),
            known: None,
        };
        assert!(JsonCodec.decode(&[], &refs).unwrap().is_null());
    }

    #[test]
    fn test_first_encounter_carries_state() {
        let leaf = Leaf::new();
        let value = Value::host(leaf.clone());

        let encoded = JsonCodec.encode(&value, &TestEncodeRefs).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        assert!(json.get(REF_KEY).is_some());
        assert_eq!(json[CLASS_KEY], "Leaf");
        assert_eq!(json[STATE_KEY]["Kind"], "leaf");
    }

    #[test]
    fn test_second_encounter_is_bare_reference() {
        let leaf = Leaf::new();
        let value = Value::List(vec![Value::host(leaf.clone()), Value::host(leaf.clone())]);

        let encoded = JsonCodec.encode(&value, &TestEncodeRefs).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&encoded).unwrap();

        let first = &json[0];
        let second = &json[1];
        assert_eq!(first[REF_KEY], second[REF_KEY]);
        assert!(first.get(STATE_KEY).is_some());
        assert!(second.get(STATE_KEY).is_none());
    }

    #[test]
    fn test_unknown_reference_decodes_to_null() {
        let leaf = Leaf::new();
        let encoded = JsonCodec
            .encode(&Value::host(leaf.clone()), &TestEncodeRefs)
            .unwrap();

        let refs = TestDecodeRefs {
            admitted: Mutex::new(Vec::new()),
            known: None,
        };
        let decoded = JsonCodec.decode(&encoded, &refs).unwrap();
        assert!(decoded.is_null());

        let admitted = refs.admitted.lock().unwrap();
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].0, leaf.core().id().unwrap());
        assert_eq!(admitted[0].1.as_deref(), Some("Leaf"));
    }

    #[test]
    fn test_known_reference_resolves() {
        let leaf = Leaf::new();
        let encoded = JsonCodec
            .encode(&Value::host(leaf.clone()), &TestEncodeRefs)
            .unwrap();
        let id = leaf.core().id().unwrap();

        let refs = TestDecodeRefs {
            admitted: Mutex::new(Vec::new()),
            known: Some((id, leaf)),
        };
        let decoded = JsonCodec.decode(&encoded, &refs).unwrap();
        assert_eq!(decoded.as_object().unwrap().id(), Some(id));
    }

    #[test]
    fn test_reserved_map_keys_rejected() {
        let mut map = BTreeMap::new();
        map.insert("$dto".to_string(), Value::from("nope"));
        assert!(JsonCodec
            .encode(&Value::Map(map), &TestEncodeRefs)
            .is_err());
    }
}
