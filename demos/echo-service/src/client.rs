//! objex echo service client
//!
//! Exercises the greeter root end to end: root query, method calls,
//! property get/set, and a property-change notification.
//!
//! Usage:
//!   cargo run --bin echo-client -- --port 4600 --name World

use clap::Parser;
use objex::{ClientSession, Value, PROPERTY_CHANGED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "echo-client")]
#[command(version)]
#[command(about = "objex echo service client")]
struct Args {
    /// Server host address
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port number
    #[arg(long, default_value_t = 4600)]
    port: u16,

    /// Name to greet
    #[arg(long, default_value = "World")]
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing subscriber failed");

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    info!("connecting to {addr}");
    let session = ClientSession::connect(addr).await?;
    let root = session.root().await?;
    info!("root object: {} ({})", root.class_name(), root.id());

    // Echo round-trip.
    let reply = root.invoke("Echo", vec![Value::from("ping")]).await?;
    info!("Echo(\"ping\") -> {reply:?}");

    // Watch for property changes.
    root.subscribe(
        PROPERTY_CHANGED,
        Arc::new(|args| info!("property changed: {args:?}")),
    )
    .await?;

    // Read, write, and read back the greeting.
    let greeting = root.get("Greeting").await?;
    info!("Greeting is {greeting:?}");

    root.set("Greeting", Value::from("Ahoy")).await?;
    let greeted = root.invoke("Greet", vec![Value::from(args.name)]).await?;
    info!("Greet -> {greeted:?}");

    // Give the change notification a moment to arrive before closing.
    tokio::time::sleep(Duration::from_millis(200)).await;
    session.close();
    Ok(())
}
