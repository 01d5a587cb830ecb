//! Client-side reference resolver
//!
//! Maps identifiers to proxies through weak references: holding an entry
//! never keeps a proxy alive. A dead entry whose identifier arrives again
//! is resurrected through the finalize table, cancelling the queued
//! release. Proxies admitted mid-decode are collected in an ordered
//! population buffer the session drains at the end of each top-level value.

use crate::client::finalize;
use crate::client::proxy::ObjectProxy;
use crate::client::session::ClientCore;
use crate::codec::EncodeRefs;
use crate::error::{Error, Result};
use crate::value::{ObjectRef, Value};
use objex_wire::ObjectId;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// The weak identifier table of one client session.
pub struct ClientResolver {
    entries: Mutex<HashMap<ObjectId, Weak<ObjectProxy>>>,
    to_populate: Mutex<Vec<(Arc<ObjectProxy>, BTreeMap<String, Value>)>>,
    decode_gate: Mutex<()>,
}

impl ClientResolver {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            to_populate: Mutex::new(Vec::new()),
            decode_gate: Mutex::new(()),
        }
    }

    /// Look up the proxy bound to `id`, resurrecting a reclaimed one when
    /// its release has not been sent yet.
    pub fn resolve_reference(&self, id: ObjectId) -> Option<Arc<ObjectProxy>> {
        let mut entries = self.entries.lock().unwrap();
        let weak = entries.get(&id)?;
        if let Some(proxy) = weak.upgrade() {
            return Some(proxy);
        }

        if let Some(entry) = finalize::cancel(id) {
            if let Some(session) = entry.session.upgrade() {
                let proxy = ObjectProxy::new(id, entry.class, session);
                entries.insert(id, Arc::downgrade(&proxy));
                return Some(proxy);
            }
        }

        entries.remove(&id);
        None
    }

    /// Plain lookup without resurrection; used for event delivery, where a
    /// reclaimed target means the notification is dropped.
    pub fn peek(&self, id: ObjectId) -> Option<Arc<ObjectProxy>> {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).and_then(|weak| weak.upgrade())
    }

    /// Resolve or create the proxy for an incoming identifier. A live proxy
    /// is reused; a dead or absent entry yields a fresh proxy under the same
    /// identifier, cancelling any queued release. Incoming state is queued
    /// for population in arrival order, so later fields override earlier
    /// ones.
    pub(crate) fn admit(
        &self,
        session: &Arc<ClientCore>,
        id: ObjectId,
        class: Option<&str>,
        state: Option<BTreeMap<String, Value>>,
    ) -> Arc<ObjectProxy> {
        let mut entries = self.entries.lock().unwrap();

        let existing = entries.get(&id).and_then(|weak| weak.upgrade());
        let proxy = match existing {
            Some(proxy) => proxy,
            None => {
                finalize::cancel(id);
                let proxy = ObjectProxy::new(id, class.unwrap_or(""), session.clone());
                entries.insert(id, Arc::downgrade(&proxy));
                proxy
            }
        };

        if let Some(state) = state {
            self.to_populate
                .lock()
                .unwrap()
                .push((proxy.clone(), state));
        }
        proxy
    }

    /// Canonical identifier text for DTO values; empty string means "not a
    /// reference; serialize inline".
    pub fn get_reference(value: &Value) -> String {
        match value {
            Value::Object(obj) => obj
                .id()
                .map(|id| id.to_string())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }

    /// True iff `value` carries the DTO capability.
    pub fn is_referenced(value: &Value) -> bool {
        matches!(value, Value::Object(_))
    }

    /// Drain the ordered population buffer.
    pub(crate) fn take_proxies_to_populate(
        &self,
    ) -> Vec<(Arc<ObjectProxy>, BTreeMap<String, Value>)> {
        std::mem::take(&mut *self.to_populate.lock().unwrap())
    }

    /// Serializes top-level decodes so interleaved population buffers never
    /// mix.
    pub(crate) fn decode_gate(&self) -> MutexGuard<'_, ()> {
        self.decode_gate.lock().unwrap()
    }

    /// Finalization-pump check: true iff `id` is dead here and its finalize
    /// entry was still queued, in which case the entry is consumed and the
    /// release may be sent. Atomic with resurrection, so a release is never
    /// sent for an identifier that resolves to a live proxy.
    pub(crate) fn reap(&self, id: ObjectId) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if let Some(weak) = entries.get(&id) {
            if weak.upgrade().is_some() {
                return false;
            }
        }
        entries.remove(&id);
        finalize::cancel(id).is_some()
    }

    /// Number of identifiers introduced to this client that still have an
    /// entry, live or dead.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode hooks: object values are spelled as bare identifier references;
/// the client never sends state and never assigns identifiers.
impl EncodeRefs for ClientResolver {
    fn reference_for(&self, obj: &ObjectRef) -> Result<ObjectId> {
        match obj {
            ObjectRef::Remote(proxy) => Ok(proxy.id()),
            ObjectRef::Host(_) => Err(Error::Value(
                "server objects cannot be serialized by a client".to_string(),
            )),
        }
    }

    fn introduction(&self, _obj: &ObjectRef) -> Result<Option<(String, Vec<(String, Value)>)>> {
        Ok(None)
    }
}
