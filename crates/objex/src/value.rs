//! The object-layer value model
//!
//! [`Value`] is what crosses the codec boundary: plain data plus object
//! references. A value is a DTO exactly when it is the [`Value::Object`]
//! variant; everything else serializes inline.
//!
//! Accessors follow the alignment rules for deserialized arguments: numeric
//! widening (`Int` to `Float`) is allowed, narrowing is rejected, everything
//! else is extracted strictly.

use crate::client::proxy::ObjectProxy;
use crate::error::{Error, Result};
use crate::host::HostObject;
use objex_wire::ObjectId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A reference to a live object on either side of the wire.
#[derive(Clone)]
pub enum ObjectRef {
    /// A server-side object (serialized by assigning it an identifier)
    Host(Arc<dyn HostObject>),
    /// A client-side proxy (serialized as its identifier)
    Remote(Arc<ObjectProxy>),
}

impl ObjectRef {
    /// The identifier, if one has been assigned yet.
    pub fn id(&self) -> Option<ObjectId> {
        match self {
            ObjectRef::Host(obj) => obj.core().id(),
            ObjectRef::Remote(proxy) => Some(proxy.id()),
        }
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectRef::Host(obj) => write!(
                f,
                "Host({}, {:?})",
                obj.class().name(),
                obj.core().id()
            ),
            ObjectRef::Remote(proxy) => {
                write!(f, "Remote({}, {})", proxy.class_name(), proxy.id())
            }
        }
    }
}

/// A dynamically typed value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn host(obj: Arc<dyn HostObject>) -> Self {
        Value::Object(ObjectRef::Host(obj))
    }

    pub fn remote(proxy: Arc<ObjectProxy>) -> Self {
        Value::Object(ObjectRef::Remote(proxy))
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }

    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Int(n) => Ok(*n),
            other => Err(mismatch("int", other)),
        }
    }

    /// Floating-point read; widens from `Int`.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Float(n) => Ok(*n),
            Value::Int(n) => Ok(*n as f64),
            other => Err(mismatch("float", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(mismatch("list", other)),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(entries) => Ok(entries),
            other => Err(mismatch("map", other)),
        }
    }

    pub fn as_object(&self) -> Result<&ObjectRef> {
        match self {
            Value::Object(r) => Ok(r),
            other => Err(mismatch("object", other)),
        }
    }

    pub fn into_string(self) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch("string", &other)),
        }
    }

    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(mismatch("list", &other)),
        }
    }

    /// The proxy behind a client-side object value.
    pub fn into_proxy(self) -> Result<Arc<ObjectProxy>> {
        match self {
            Value::Object(ObjectRef::Remote(proxy)) => Ok(proxy),
            other => Err(mismatch("proxy", &other)),
        }
    }
}

fn mismatch(expected: &str, got: &Value) -> Error {
    Error::Value(format!("expected {expected}, got {}", got.kind()))
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            // Object identity is the identifier.
            (Value::Object(a), Value::Object(b)) => match (a.id(), b.id()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening_int_to_float() {
        assert_eq!(Value::Int(7).as_f64().unwrap(), 7.0);
        assert_eq!(Value::Float(1.5).as_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_narrowing_rejected() {
        assert!(Value::Float(1.5).as_i64().is_err());
        assert!(Value::Str("3".into()).as_i64().is_err());
    }

    #[test]
    fn test_strict_extraction() {
        assert_eq!(Value::from("hi").as_str().unwrap(), "hi");
        assert!(Value::Int(1).as_str().is_err());
        assert!(Value::Null.as_bool().is_err());
    }

    #[test]
    fn test_kind_in_error_message() {
        let err = Value::Int(3).as_str().unwrap_err();
        assert!(err.to_string().contains("expected string, got int"));
    }

    #[test]
    fn test_into_owned_extraction() {
        assert_eq!(Value::from("hi").into_string().unwrap(), "hi");
        assert_eq!(
            Value::List(vec![Value::Int(1)]).into_list().unwrap(),
            vec![Value::Int(1)]
        );
        assert!(Value::Null.into_list().is_err());
    }

    #[test]
    fn test_equality() {
        assert_eq!(Value::from(3i64), Value::Int(3));
        assert_ne!(Value::Int(3), Value::Float(3.0));
        assert_eq!(
            Value::List(vec![Value::Null, Value::from(true)]),
            Value::List(vec![Value::Null, Value::Bool(true)]),
        );
    }
}
