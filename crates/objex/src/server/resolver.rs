//! Server-side reference resolver
//!
//! Maps identifiers to live server objects, strongly, for as long as any
//! session has exposed them. Identifier assignment happens at serialization
//! time and is idempotent: no two callers ever obtain different identifiers
//! for the same object. Each tracked object carries exactly one
//! property-change subscription that forwards into the resolver's change
//! sink, where sessions pick it up and translate it into event
//! notifications.

use crate::codec::{DecodeRefs, EncodeRefs};
use crate::error::{Error, Result};
use crate::host::{HostObject, SubscriptionId, PROPERTY_CHANGED};
use crate::server::SessionId;
use crate::value::{ObjectRef, Value};
use objex_wire::ObjectId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Property-change observer: `(object, property)` per change.
pub type ChangeSink = Arc<dyn Fn(ObjectId, &str) + Send + Sync>;

struct Entry {
    object: Arc<dyn HostObject>,
    subscription: SubscriptionId,
    sessions: HashSet<SessionId>,
}

/// The strong identifier table, shared by every session of a server.
pub struct ServerResolver {
    entries: Mutex<HashMap<ObjectId, Entry>>,
    sinks: Mutex<Vec<(u64, ChangeSink)>>,
    next_sink: AtomicU64,
    // Handed to per-object forwarding subscriptions; weak, so a tracked
    // object never keeps its resolver alive.
    weak_self: Weak<ServerResolver>,
}

impl ServerResolver {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            entries: Mutex::new(HashMap::new()),
            sinks: Mutex::new(Vec::new()),
            next_sink: AtomicU64::new(1),
            weak_self: weak_self.clone(),
        })
    }

    /// Look up the object bound to `id`. Never creates one.
    pub fn resolve_reference(&self, id: ObjectId) -> Option<Arc<dyn HostObject>> {
        let entries = self.entries.lock().unwrap();
        entries.get(&id).map(|e| e.object.clone())
    }

    /// True iff `value` carries the DTO capability.
    pub fn is_referenced(value: &Value) -> bool {
        matches!(value, Value::Object(_))
    }

    /// Assign an identifier to `obj` if it has none yet, attach the
    /// property-change subscription, and record that `session` exposed it.
    /// Idempotent in every part.
    pub fn get_or_assign_reference(
        &self,
        session: SessionId,
        obj: &Arc<dyn HostObject>,
    ) -> ObjectId {
        let mut entries = self.entries.lock().unwrap();

        let id = match obj.core().id() {
            Some(id) => id,
            None => obj.core().assign_id(ObjectId::generate()),
        };

        let entry = entries.entry(id).or_insert_with(|| {
            let resolver = self.weak_self.clone();
            let subscription = obj.core().subscribe(
                PROPERTY_CHANGED,
                Arc::new(move |args| {
                    if let (Some(resolver), Value::Str(property)) = (resolver.upgrade(), args) {
                        resolver.reference_property_changed(id, property);
                    }
                }),
            );
            Entry {
                object: obj.clone(),
                subscription,
                sessions: HashSet::new(),
            }
        });
        entry.sessions.insert(session);
        id
    }

    /// Unsubscribe and remove `id` unconditionally. No-op when absent.
    pub fn remove_reference(&self, id: ObjectId) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.remove(&id) {
            entry
                .object
                .core()
                .unsubscribe(PROPERTY_CHANGED, entry.subscription);
        }
    }

    /// Drop one session's exposure of `id`; the object leaves the table
    /// when no session still exposes it.
    pub fn release(&self, id: ObjectId, session: SessionId) {
        let mut entries = self.entries.lock().unwrap();
        let gone = match entries.get_mut(&id) {
            Some(entry) => {
                entry.sessions.remove(&session);
                entry.sessions.is_empty()
            }
            None => false,
        };
        if gone {
            if let Some(entry) = entries.remove(&id) {
                entry
                    .object
                    .core()
                    .unsubscribe(PROPERTY_CHANGED, entry.subscription);
            }
        }
    }

    /// Drop every exposure a closing session held.
    pub fn release_session(&self, session: SessionId) {
        let ids: Vec<ObjectId> = {
            let entries = self.entries.lock().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.sessions.contains(&session))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.release(id, session);
        }
    }

    /// Attach a change observer; sessions use this to forward
    /// `PropertyChanged` to their clients.
    pub fn subscribe_changes(&self, sink: ChangeSink) -> u64 {
        let token = self.next_sink.fetch_add(1, Ordering::SeqCst);
        self.sinks.lock().unwrap().push((token, sink));
        token
    }

    pub fn unsubscribe_changes(&self, token: u64) {
        self.sinks.lock().unwrap().retain(|(t, _)| *t != token);
    }

    fn reference_property_changed(&self, id: ObjectId, property: &str) {
        let snapshot: Vec<ChangeSink> = {
            let sinks = self.sinks.lock().unwrap();
            sinks.iter().map(|(_, s)| s.clone()).collect()
        };
        for sink in snapshot {
            sink(id, property);
        }
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode hooks for one session: object values are assigned identifiers in
/// the shared table and introduced with a class name and state snapshot.
pub struct ServerEncodeRefs {
    pub resolver: Arc<ServerResolver>,
    pub session: SessionId,
}

impl EncodeRefs for ServerEncodeRefs {
    fn reference_for(&self, obj: &ObjectRef) -> Result<ObjectId> {
        match obj {
            ObjectRef::Host(host) => Ok(self.resolver.get_or_assign_reference(self.session, host)),
            ObjectRef::Remote(_) => Err(Error::Value(
                "client proxies cannot be serialized by the server".to_string(),
            )),
        }
    }

    fn introduction(&self, obj: &ObjectRef) -> Result<Option<(String, Vec<(String, Value)>)>> {
        match obj {
            ObjectRef::Host(host) => {
                let state = host.class().snapshot(host.as_any())?;
                Ok(Some((host.class().name().to_string(), state)))
            }
            ObjectRef::Remote(_) => Ok(None),
        }
    }
}

/// Decode hooks: an incoming identifier already refers to a local server
/// object, or it is unknown here and decodes to null.
pub struct ServerDecodeRefs {
    pub resolver: Arc<ServerResolver>,
}

impl DecodeRefs for ServerDecodeRefs {
    fn admit(
        &self,
        id: ObjectId,
        _class: Option<&str>,
        _state: Option<BTreeMap<String, Value>>,
    ) -> Result<Option<ObjectRef>> {
        Ok(self.resolver.resolve_reference(id).map(ObjectRef::Host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{ClassBuilder, ClassDescriptor};
    use crate::host::DtoCore;
    use std::any::Any;

    struct Widget {
        core: DtoCore,
        class: Arc<ClassDescriptor>,
    }

    impl Widget {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                core: DtoCore::new(),
                class: ClassBuilder::<Widget>::new("Widget").build(),
            })
        }
    }

    impl HostObject for Widget {
        fn core(&self) -> &DtoCore {
            &self.core
        }
        fn class(&self) -> &Arc<ClassDescriptor> {
            &self.class
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_assignment_is_idempotent() {
        let resolver = ServerResolver::new();
        let widget: Arc<dyn HostObject> = Widget::new();
        let session = SessionId(1);

        let a = resolver.get_or_assign_reference(session, &widget);
        let b = resolver.get_or_assign_reference(session, &widget);
        assert_eq!(a, b);
        assert_eq!(resolver.len(), 1);
    }

    #[test]
    fn test_resolve_never_creates() {
        let resolver = ServerResolver::new();
        assert!(resolver.resolve_reference(ObjectId::generate()).is_none());
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_release_per_session() {
        let resolver = ServerResolver::new();
        let widget: Arc<dyn HostObject> = Widget::new();
        let id = resolver.get_or_assign_reference(SessionId(1), &widget);
        resolver.get_or_assign_reference(SessionId(2), &widget);

        resolver.release(id, SessionId(1));
        assert!(resolver.contains(id));

        resolver.release(id, SessionId(2));
        assert!(!resolver.contains(id));
    }

    #[test]
    fn test_release_session_sweeps() {
        let resolver = ServerResolver::new();
        let a: Arc<dyn HostObject> = Widget::new();
        let b: Arc<dyn HostObject> = Widget::new();
        resolver.get_or_assign_reference(SessionId(7), &a);
        resolver.get_or_assign_reference(SessionId(7), &b);
        assert_eq!(resolver.len(), 2);

        resolver.release_session(SessionId(7));
        assert!(resolver.is_empty());
    }

    #[test]
    fn test_is_referenced_is_the_object_variant() {
        let widget: Arc<dyn HostObject> = Widget::new();
        assert!(ServerResolver::is_referenced(&Value::Object(
            crate::value::ObjectRef::Host(widget)
        )));
        assert!(!ServerResolver::is_referenced(&Value::Int(1)));
    }

    #[test]
    fn test_remove_reference_absent_is_noop() {
        let resolver = ServerResolver::new();
        resolver.remove_reference(ObjectId::generate());
    }

    #[test]
    fn test_property_changes_forward_to_sink() {
        let resolver = ServerResolver::new();
        let widget = Widget::new();
        let widget_dyn: Arc<dyn HostObject> = widget.clone();
        let id = resolver.get_or_assign_reference(SessionId(1), &widget_dyn);

        let seen: Arc<Mutex<Vec<(ObjectId, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        resolver.subscribe_changes(Arc::new(move |id, property| {
            sink_seen.lock().unwrap().push((id, property.to_string()));
        }));

        widget.core.notify_property_changed("Color");
        assert_eq!(seen.lock().unwrap().as_slice(), &[(id, "Color".to_string())]);

        // Removal detaches the forwarding subscription.
        resolver.remove_reference(id);
        widget.core.notify_property_changed("Color");
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_reassignment_after_removal_keeps_identifier() {
        let resolver = ServerResolver::new();
        let widget: Arc<dyn HostObject> = Widget::new();
        let id = resolver.get_or_assign_reference(SessionId(1), &widget);

        resolver.remove_reference(id);
        assert!(!resolver.contains(id));

        let again = resolver.get_or_assign_reference(SessionId(1), &widget);
        assert_eq!(again, id);
        assert!(resolver.contains(id));
    }
}
