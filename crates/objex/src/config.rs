//! Session configuration

use objex_wire::DEFAULT_MAX_FRAME_SIZE;
use std::time::Duration;

/// Server-side configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on one frame, read and write (default 64 MiB)
    pub max_frame_size: usize,
    /// Bound on the per-session dispatch and write queues; overflow faults
    /// the session (default 10,000 envelopes)
    pub max_queue: usize,
    /// Maximum concurrent sessions (default 1,000)
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_queue: 10_000,
            max_connections: 1_000,
        }
    }
}

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on one frame, read and write (default 64 MiB)
    pub max_frame_size: usize,
    /// Bound on the dispatch and write queues (default 10,000 envelopes)
    pub max_queue: usize,
    /// Deadline for each outgoing request (default 30 s)
    pub request_timeout: Duration,
    /// How long a reclaimed proxy's identifier must stay dead before its
    /// release is sent; a resurrection inside this window cancels the send
    /// (default 50 ms)
    pub finalize_quiescence: Duration,
    /// Finalization pump tick interval (default 25 ms)
    pub finalize_tick: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_queue: 10_000,
            request_timeout: Duration::from_secs(30),
            finalize_quiescence: Duration::from_millis(50),
            finalize_tick: Duration::from_millis(25),
        }
    }
}
