//! Server-side object support
//!
//! A server object becomes remotable by embedding a [`DtoCore`] (identifier
//! cell plus event listener table) and implementing [`HostObject`]. The
//! resolver assigns the identifier the first time the object is serialized;
//! the object raises events through its core and the session layer forwards
//! them to subscribed clients.

use crate::class::ClassDescriptor;
use crate::error::{Error, Result};
use crate::value::Value;
use objex_wire::ObjectId;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// The property-change event every remotable class carries.
pub const PROPERTY_CHANGED: &str = "PropertyChanged";

/// Keys of the property-change notification payload.
pub(crate) const CHANGE_PROPERTY_KEY: &str = "property";
pub(crate) const CHANGE_VALUE_KEY: &str = "value";

/// Event listener attached to a host object.
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle for detaching a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Per-object state every remotable server object embeds.
pub struct DtoCore {
    id: OnceLock<ObjectId>,
    listeners: Mutex<HashMap<String, Vec<(u64, EventListener)>>>,
    next_listener: AtomicU64,
}

impl DtoCore {
    pub fn new() -> Self {
        Self {
            id: OnceLock::new(),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    /// The identifier, once the object has been serialized at least once.
    pub fn id(&self) -> Option<ObjectId> {
        self.id.get().copied()
    }

    /// Set the identifier exactly once; returns the winning value.
    pub(crate) fn assign_id(&self, id: ObjectId) -> ObjectId {
        *self.id.get_or_init(|| id)
    }

    /// Attach a listener to the named event.
    pub fn subscribe(&self, event: &str, listener: EventListener) -> SubscriptionId {
        let token = self.next_listener.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self.listeners.lock().unwrap();
        listeners
            .entry(event.to_string())
            .or_default()
            .push((token, listener));
        SubscriptionId(token)
    }

    /// Detach a listener. No-op when absent.
    pub fn unsubscribe(&self, event: &str, subscription: SubscriptionId) {
        let mut listeners = self.listeners.lock().unwrap();
        if let Some(entries) = listeners.get_mut(event) {
            entries.retain(|(token, _)| *token != subscription.0);
            if entries.is_empty() {
                listeners.remove(event);
            }
        }
    }

    /// Raise the named event. Listeners run outside the table lock, so a
    /// listener may subscribe or unsubscribe without deadlocking.
    pub fn raise(&self, event: &str, args: &Value) {
        let snapshot: Vec<EventListener> = {
            let listeners = self.listeners.lock().unwrap();
            match listeners.get(event) {
                Some(entries) => entries.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in snapshot {
            listener(args);
        }
    }

    /// Raise `PropertyChanged` for the named property. Call after mutating
    /// a property so subscribed clients see the new value.
    pub fn notify_property_changed(&self, property: &str) {
        self.raise(PROPERTY_CHANGED, &Value::Str(property.to_string()));
    }
}

impl Default for DtoCore {
    fn default() -> Self {
        Self::new()
    }
}

/// A server-side remotable object.
pub trait HostObject: Send + Sync + 'static {
    /// The embedded identifier and event state.
    fn core(&self) -> &DtoCore;

    /// The member table for this object's class.
    fn class(&self) -> &Arc<ClassDescriptor>;

    /// Typed access for member handlers.
    fn as_any(&self) -> &dyn Any;
}

impl dyn HostObject {
    /// Read a property through the class descriptor.
    pub fn get_property(&self, property: &str) -> Result<Value> {
        let getter = self
            .class()
            .getter(property)
            .ok_or_else(|| Error::UnknownMember(format!("unknown property: {property}")))?;
        getter(self.as_any())
    }

    /// Write a property through the class descriptor.
    pub fn set_property(&self, property: &str, value: Value) -> Result<()> {
        let setter = self
            .class()
            .setter(property)
            .ok_or_else(|| Error::UnknownMember(format!("unknown property: {property}")))?;
        setter(self.as_any(), value)
    }

    /// Invoke a method selected by name and arity.
    pub fn invoke(&self, method: &str, parameters: u16, args: Vec<Value>) -> Result<Value> {
        let handler = self.class().method(method, parameters)?;
        handler(self.as_any(), args)
    }
}
