//! Shared fixtures: a test object graph and an in-memory server/client
//! harness over `tokio::io::duplex`.

use objex::{
    ClassBuilder, ClassDescriptor, ClientBuilder, ClientSession, DtoCore, HostObject,
    ObjectServer, Principal, Value,
};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A counter child object, created on demand by the root.
pub struct Counter {
    core: DtoCore,
    class: Arc<ClassDescriptor>,
    count: Mutex<i64>,
}

impl Counter {
    fn new() -> Arc<Self> {
        let class = ClassBuilder::<Counter>::new("Counter")
            .getter("Count", |counter| {
                Ok(Value::Int(*counter.count.lock().unwrap()))
            })
            .method("Add", 1, |counter, args| {
                let delta = args[0].as_i64()?;
                let total = {
                    let mut count = counter.count.lock().unwrap();
                    *count += delta;
                    *count
                };
                counter.core.notify_property_changed("Count");
                Ok(Value::Int(total))
            })
            .build();

        Arc::new(Self {
            core: DtoCore::new(),
            class,
            count: Mutex::new(0),
        })
    }
}

impl HostObject for Counter {
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

/// The root object every test server exposes.
pub struct TestRoot {
    core: DtoCore,
    class: Arc<ClassDescriptor>,
    greeting: Mutex<String>,
    counters: Mutex<HashMap<String, Arc<Counter>>>,
}

impl TestRoot {
    pub fn new() -> Arc<Self> {
        let class = ClassBuilder::<TestRoot>::new("TestRoot")
            .method("Echo", 1, |_root, mut args| Ok(args.remove(0)))
            .method("Counter", 1, |root, args| {
                let name = args[0].as_str()?.to_string();
                let counter = root
                    .counters
                    .lock()
                    .unwrap()
                    .entry(name)
                    .or_insert_with(Counter::new)
                    .clone();
                Ok(Value::host(counter))
            })
            .getter("Greeting", |root| {
                Ok(Value::from(root.greeting.lock().unwrap().clone()))
            })
            .setter("Greeting", |root, value| {
                *root.greeting.lock().unwrap() = value.into_string()?;
                root.core.notify_property_changed("Greeting");
                Ok(())
            })
            .build();

        Arc::new(Self {
            core: DtoCore::new(),
            class,
            greeting: Mutex::new("hello".to_string()),
            counters: Mutex::new(HashMap::new()),
        })
    }
}

impl HostObject for TestRoot {
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

/// A fresh server around a new test root.
pub fn server() -> Arc<ObjectServer> {
    Arc::new(ObjectServer::new(TestRoot::new()))
}

/// Connect one client session to `server` over an in-memory stream.
pub fn connect(server: &Arc<ObjectServer>, builder: ClientBuilder) -> ClientSession {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let server = server.clone();
    tokio::spawn(async move {
        let _ = server
            .serve_stream(server_io, Principal::new("test"))
            .await;
    });
    builder.from_stream(client_io)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
