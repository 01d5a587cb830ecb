//! Session authentication
//!
//! The server consults an [`Authenticator`] once per accepted connection,
//! before any session worker starts. A `None` principal rejects the
//! connection. The granted principal is recorded on the session's tracing
//! span, so every log line a session's workers emit carries it.

use std::fmt;
use std::net::SocketAddr;

/// The identity a session runs under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Decides which principal, if any, a connecting peer is granted.
pub trait Authenticator: Send + Sync {
    fn principal(&self, peer: SocketAddr) -> Option<Principal>;
}

/// Grants every peer an anonymous principal.
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn principal(&self, _peer: SocketAddr) -> Option<Principal> {
        Some(Principal::new("anonymous"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all_grants_anonymous() {
        let auth = AllowAll;
        let peer: SocketAddr = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(auth.principal(peer), Some(Principal::new("anonymous")));
    }
}
