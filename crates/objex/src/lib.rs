//! objex: a bidirectional remote-object RPC transport
//!
//! A server exposes a live graph of objects to one or more clients over a
//! single duplex byte stream. Each client obtains local proxies that
//! forward property reads/writes, method invocations, and event
//! subscriptions to their origin. Object identity is preserved across the
//! wire: every object has a stable identifier, and a peer that receives
//! the same identifier twice resolves to the same local object.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Object layer (this crate)                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Server                      │  Client                       │
//! │  - strong resolver           │  - weak resolver              │
//! │  - dispatch machine          │  - proxies + finalization     │
//! │  - session workers           │  - session workers            │
//! ├──────────────────────────────────────────────────────────────┤
//! │              Wire layer (objex-wire crate)                   │
//! │  envelopes · identifiers · framed transport                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Server example
//!
//! ```no_run
//! use objex::{ClassBuilder, ClassDescriptor, DtoCore, HostObject, ObjectServer, Value};
//! use std::any::Any;
//! use std::sync::{Arc, Mutex};
//!
//! struct Root {
//!     core: DtoCore,
//!     class: Arc<ClassDescriptor>,
//!     greeting: Mutex<String>,
//! }
//!
//! impl HostObject for Root {
//!     fn core(&self) -> &DtoCore { &self.core }
//!     fn class(&self) -> &Arc<ClassDescriptor> { &self.class }
//!     fn as_any(&self) -> &dyn Any { self }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let class = ClassBuilder::<Root>::new("Root")
//!         .method("Echo", 1, |_root, mut args| Ok(args.remove(0)))
//!         .getter("Greeting", |root| {
//!             Ok(Value::from(root.greeting.lock().unwrap().clone()))
//!         })
//!         .build();
//!
//!     let root = Arc::new(Root {
//!         core: DtoCore::new(),
//!         class,
//!         greeting: Mutex::new("hello".to_string()),
//!     });
//!
//!     let server = ObjectServer::new(root);
//!     server.run("127.0.0.1:4600".parse().unwrap()).await.unwrap();
//! }
//! ```
//!
//! # Client example
//!
//! ```no_run
//! use objex::{ClientSession, Value};
//!
//! #[tokio::main]
//! async fn main() {
//!     let session = ClientSession::connect("127.0.0.1:4600".parse().unwrap())
//!         .await
//!         .unwrap();
//!
//!     let root = session.root().await.unwrap();
//!     let reply = root.invoke("Echo", vec![Value::from("hi")]).await.unwrap();
//!     assert_eq!(reply, Value::from("hi"));
//! }
//! ```

pub mod auth;
pub mod class;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod host;
pub mod server;
pub mod value;

pub use auth::{AllowAll, Authenticator, Principal};
pub use class::{ClassBuilder, ClassDescriptor};
pub use client::{ClientBuilder, ClientResolver, ClientSession, HandlerId, ObjectProxy};
pub use codec::{DecodeRefs, EncodeRefs, JsonCodec, PayloadCodec};
pub use config::{ClientConfig, ServerConfig};
pub use error::{Error, Result};
pub use host::{DtoCore, EventListener, HostObject, SubscriptionId, PROPERTY_CHANGED};
pub use server::{ObjectServer, ServerResolver, ServerStats, ServerStatsSnapshot};
pub use value::{ObjectRef, Value};

// Wire-layer types that appear in this crate's public API.
pub use objex_wire::{Envelope, MessageId, MessageType, ObjectId, WireError};
