//! objex echo service server
//!
//! Hosts a greeter root object with an `Echo` method, a `Greeting`
//! property, and property-change notifications.
//!
//! Usage:
//!   cargo run --bin echo-server -- --port 4600

use clap::Parser;
use objex::{
    ClassBuilder, ClassDescriptor, DtoCore, HostObject, ObjectServer, Result, Value,
};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(version)]
#[command(about = "objex echo service - hosts a greeter root object")]
struct Args {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to listen on
    #[arg(long, default_value_t = 4600)]
    port: u16,
}

/// The root object every client discovers.
struct Greeter {
    core: DtoCore,
    class: Arc<ClassDescriptor>,
    greeting: Mutex<String>,
}

impl Greeter {
    fn new() -> Arc<Self> {
        let class = ClassBuilder::<Greeter>::new("Greeter")
            .method("Echo", 1, |_greeter, mut args| Ok(args.remove(0)))
            .method("Greet", 1, |greeter, args| {
                let name = args[0].as_str()?;
                let greeting = greeter.greeting.lock().unwrap().clone();
                Ok(Value::from(format!("{greeting}, {name}!")))
            })
            .getter("Greeting", |greeter| {
                Ok(Value::from(greeter.greeting.lock().unwrap().clone()))
            })
            .setter("Greeting", |greeter, value| {
                *greeter.greeting.lock().unwrap() = value.into_string()?;
                greeter.core.notify_property_changed("Greeting");
                Ok(())
            })
            .build();

        Arc::new(Self {
            core: DtoCore::new(),
            class,
            greeting: Mutex::new("Hello".to_string()),
        })
    }
}

impl HostObject for Greeter {
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

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("invalid host/port");

    info!("starting echo service on {addr}");
    let server = ObjectServer::new(Greeter::new());
    server.run(addr).await
}
