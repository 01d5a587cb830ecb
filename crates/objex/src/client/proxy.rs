//! Client-side proxy objects
//!
//! An [`ObjectProxy`] stands in for one remote object: operations on it
//! suspend until the matching response arrives over the session it was
//! received on. The proxy caches property values as they are observed
//! (population at introduction, `PropertyChanged` notifications, reads) and
//! keeps per-event handler lists; the first handler for an event attaches
//! the remote subscription, the last removal detaches it.
//!
//! Cached object-valued properties are held as identifiers, not strong
//! references, and re-resolve through the session's resolver on read. The
//! object graph is cyclic by nature; the identifier table is the
//! indirection that keeps proxies collectable.

use crate::client::finalize::{self, FinalizeEntry};
use crate::client::session::ClientCore;
use crate::error::Result;
use crate::host::{EventListener, CHANGE_PROPERTY_KEY, CHANGE_VALUE_KEY, PROPERTY_CHANGED};
use crate::value::Value;
use objex_wire::{Envelope, MessageId, ObjectId};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Handle for detaching a local event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// A cached property value. Object values are held by identifier so that
/// cached state never pins other proxies alive.
enum Cached {
    Plain(Value),
    Ref(ObjectId),
}

/// Local stub for a remote object.
pub struct ObjectProxy {
    id: ObjectId,
    class: String,
    session: Arc<ClientCore>,
    state: Mutex<BTreeMap<String, Cached>>,
    handlers: Mutex<HashMap<String, Vec<(u64, EventListener)>>>,
    next_handler: AtomicU64,
    populated: AtomicBool,
}

impl ObjectProxy {
    pub(crate) fn new(id: ObjectId, class: impl Into<String>, session: Arc<ClientCore>) -> Arc<Self> {
        Arc::new(Self {
            id,
            class: class.into(),
            session,
            state: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            populated: AtomicBool::new(false),
        })
    }

    /// The identifier this proxy is bound to.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// The remote class name, as introduced by the server.
    pub fn class_name(&self) -> &str {
        &self.class
    }

    /// Whether the server-provided state snapshot has been applied.
    pub fn is_populated(&self) -> bool {
        self.populated.load(Ordering::SeqCst)
    }

    /// The locally cached value of a property, if one has been observed.
    pub fn cached(&self, property: &str) -> Option<Value> {
        let state = self.state.lock().unwrap();
        match state.get(property)? {
            Cached::Plain(value) => Some(value.clone()),
            Cached::Ref(id) => self
                .session
                .resolver()
                .peek(*id)
                .map(Value::remote),
        }
    }

    /// Read a property from the remote object.
    pub async fn get(&self, property: &str) -> Result<Value> {
        let envelope = Envelope::get(MessageId::generate(), self.id, property);
        let value = self.session.request(envelope).await?;
        self.cache_store(property, &value);
        Ok(value)
    }

    /// Write a property on the remote object.
    pub async fn set(&self, property: &str, value: Value) -> Result<()> {
        let payload = self.session.encode_payload(&value)?;
        let envelope = Envelope::set(MessageId::generate(), self.id, property, payload);
        self.session.request(envelope).await?;
        self.cache_store(property, &value);
        Ok(())
    }

    /// Invoke a method on the remote object.
    pub async fn invoke(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let parameters = args.len() as u16;
        let payload = self.session.encode_payload(&Value::List(args))?;
        let envelope = Envelope::query(MessageId::generate(), self.id, method, parameters, payload);
        self.session.request(envelope).await
    }

    /// Attach a handler to a remote event. The first handler for an event
    /// sends the remote subscription.
    pub async fn subscribe(&self, event: &str, listener: EventListener) -> Result<HandlerId> {
        let token = self.next_handler.fetch_add(1, Ordering::SeqCst);
        let is_first = {
            let mut handlers = self.handlers.lock().unwrap();
            let entries = handlers.entry(event.to_string()).or_default();
            entries.push((token, listener));
            entries.len() == 1
        };

        if is_first {
            let envelope = Envelope::event_add(MessageId::generate(), self.id, event);
            if let Err(e) = self.session.request(envelope).await {
                let mut handlers = self.handlers.lock().unwrap();
                if let Some(entries) = handlers.get_mut(event) {
                    entries.retain(|(t, _)| *t != token);
                    if entries.is_empty() {
                        handlers.remove(event);
                    }
                }
                return Err(e);
            }
        }
        Ok(HandlerId(token))
    }

    /// Detach a handler. The last removal for an event sends the remote
    /// unsubscription.
    pub async fn unsubscribe(&self, event: &str, handler: HandlerId) -> Result<()> {
        let was_last = {
            let mut handlers = self.handlers.lock().unwrap();
            match handlers.get_mut(event) {
                Some(entries) => {
                    let before = entries.len();
                    entries.retain(|(t, _)| *t != handler.0);
                    let removed = entries.len() != before;
                    if entries.is_empty() {
                        handlers.remove(event);
                        removed
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if was_last {
            let envelope = Envelope::event_remove(MessageId::generate(), self.id, event);
            self.session.request(envelope).await?;
        }
        Ok(())
    }

    /// Apply a server-provided state snapshot; newly arrived fields
    /// override previously cached values.
    pub(crate) fn apply_population(&self, incoming: BTreeMap<String, Value>) {
        {
            let mut state = self.state.lock().unwrap();
            for (property, value) in &incoming {
                state.insert(property.clone(), Self::to_cached(value));
            }
        }
        self.populated.store(true, Ordering::SeqCst);
    }

    /// Deliver an incoming event notification to local handlers.
    pub(crate) fn deliver(&self, event: &str, args: &Value) {
        if event == PROPERTY_CHANGED {
            if let Ok(map) = args.as_map() {
                if let (Some(Value::Str(property)), Some(value)) =
                    (map.get(CHANGE_PROPERTY_KEY), map.get(CHANGE_VALUE_KEY))
                {
                    self.cache_store(property, value);
                }
            }
        }

        let snapshot: Vec<EventListener> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(event) {
                Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            listener(args);
        }
    }

    fn cache_store(&self, property: &str, value: &Value) {
        self.state
            .lock()
            .unwrap()
            .insert(property.to_string(), Self::to_cached(value));
    }

    fn to_cached(value: &Value) -> Cached {
        match value {
            Value::Object(obj) => match obj.id() {
                Some(id) => Cached::Ref(id),
                None => Cached::Plain(Value::Null),
            },
            other => Cached::Plain(other.clone()),
        }
    }
}

impl Drop for ObjectProxy {
    fn drop(&mut self) {
        // The weak table entry stays behind; the finalization pump sends the
        // release once this entry survives the quiescence window.
        if self.session.is_closed() {
            return;
        }
        finalize::request(
            self.id,
            FinalizeEntry {
                session: Arc::downgrade(&self.session),
                class: self.class.clone(),
                requested_at: Instant::now(),
            },
        );
    }
}

impl std::fmt::Debug for ObjectProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectProxy")
            .field("id", &self.id)
            .field("class", &self.class)
            .field("populated", &self.is_populated())
            .finish()
    }
}
