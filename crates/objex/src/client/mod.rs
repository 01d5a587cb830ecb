//! Client side: the weak reference resolver, proxy objects, the session
//! runtime, and the finalization pump.

pub mod finalize;
pub mod proxy;
pub mod resolver;
pub mod session;

pub use proxy::{HandlerId, ObjectProxy};
pub use resolver::ClientResolver;
pub use session::{ClientBuilder, ClientSession};
