//! Per-class member tables
//!
//! The dispatcher selects methods, properties, and events by name at
//! runtime. Instead of reflection, every remotable class registers a
//! [`ClassDescriptor`] once: methods keyed by name and arity, properties by
//! name with getter and optional setter, and the event names the class can
//! raise. [`ClassBuilder`] erases the concrete type behind `&dyn Any` so one
//! descriptor type serves every class.

use crate::error::{Error, Result};
use crate::host::PROPERTY_CHANGED;
use crate::value::Value;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

/// Erased method handler: receiver plus deserialized arguments.
pub type MethodFn = Arc<dyn Fn(&dyn Any, Vec<Value>) -> Result<Value> + Send + Sync>;
/// Erased property getter.
pub type GetFn = Arc<dyn Fn(&dyn Any) -> Result<Value> + Send + Sync>;
/// Erased property setter.
pub type SetFn = Arc<dyn Fn(&dyn Any, Value) -> Result<()> + Send + Sync>;

/// Member table for one remotable class.
pub struct ClassDescriptor {
    name: String,
    methods: HashMap<(String, u16), MethodFn>,
    getters: HashMap<String, GetFn>,
    setters: HashMap<String, SetFn>,
    events: HashSet<String>,
}

impl ClassDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Select a method by name and arity.
    pub fn method(&self, name: &str, parameters: u16) -> Result<&MethodFn> {
        if let Some(handler) = self.methods.get(&(name.to_string(), parameters)) {
            return Ok(handler);
        }
        if self.methods.keys().any(|(n, _)| n == name) {
            return Err(Error::ArityMismatch {
                member: name.to_string(),
                parameters,
            });
        }
        Err(Error::UnknownMember(format!("unknown method: {name}")))
    }

    pub fn getter(&self, name: &str) -> Option<&GetFn> {
        self.getters.get(name)
    }

    pub fn setter(&self, name: &str) -> Option<&SetFn> {
        self.setters.get(name)
    }

    pub fn has_event(&self, name: &str) -> bool {
        self.events.contains(name)
    }

    /// Read every readable property, sorted by name. This is the state
    /// snapshot sent alongside the first introduction of an object.
    pub fn snapshot(&self, obj: &dyn Any) -> Result<Vec<(String, Value)>> {
        let mut names: Vec<&String> = self.getters.keys().collect();
        names.sort();

        let mut state = Vec::with_capacity(names.len());
        for name in names {
            let value = (self.getters[name])(obj)?;
            state.push((name.clone(), value));
        }
        Ok(state)
    }
}

/// Builder for a [`ClassDescriptor`], typed over the concrete class.
pub struct ClassBuilder<T> {
    name: String,
    methods: HashMap<(String, u16), MethodFn>,
    getters: HashMap<String, GetFn>,
    setters: HashMap<String, SetFn>,
    events: HashSet<String>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Send + Sync + 'static> ClassBuilder<T> {
    pub fn new(name: impl Into<String>) -> Self {
        // Every class can raise PropertyChanged through its DtoCore.
        let mut events = HashSet::new();
        events.insert(PROPERTY_CHANGED.to_string());

        Self {
            name: name.into(),
            methods: HashMap::new(),
            getters: HashMap::new(),
            setters: HashMap::new(),
            events,
            _marker: PhantomData,
        }
    }

    /// Register a method under the given name and arity.
    pub fn method<F>(mut self, name: impl Into<String>, parameters: u16, f: F) -> Self
    where
        F: Fn(&T, Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        self.methods.insert(
            (name.into(), parameters),
            Arc::new(move |any, args| {
                let obj = downcast::<T>(any, &class)?;
                f(obj, args)
            }),
        );
        self
    }

    /// Register a property getter.
    pub fn getter<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T) -> Result<Value> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        self.getters.insert(
            name.into(),
            Arc::new(move |any| {
                let obj = downcast::<T>(any, &class)?;
                f(obj)
            }),
        );
        self
    }

    /// Register a property setter.
    pub fn setter<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&T, Value) -> Result<()> + Send + Sync + 'static,
    {
        let class = self.name.clone();
        self.setters.insert(
            name.into(),
            Arc::new(move |any, value| {
                let obj = downcast::<T>(any, &class)?;
                f(obj, value)
            }),
        );
        self
    }

    /// Declare an event name clients may subscribe to.
    pub fn event(mut self, name: impl Into<String>) -> Self {
        self.events.insert(name.into());
        self
    }

    pub fn build(self) -> Arc<ClassDescriptor> {
        Arc::new(ClassDescriptor {
            name: self.name,
            methods: self.methods,
            getters: self.getters,
            setters: self.setters,
            events: self.events,
        })
    }
}

fn downcast<'a, T: 'static>(any: &'a dyn Any, class: &str) -> Result<&'a T> {
    any.downcast_ref::<T>()
        .ok_or_else(|| Error::invocation(format!("receiver is not a {class}")))
}
