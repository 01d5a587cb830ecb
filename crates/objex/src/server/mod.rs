//! Server side: the strong reference resolver, the dispatch state machine,
//! and the session runtime.

pub mod dispatch;
pub mod resolver;
pub mod session;

pub use resolver::ServerResolver;
pub use session::{ObjectServer, ServerStats, ServerStatsSnapshot};

/// Identifies one live session within a server process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
