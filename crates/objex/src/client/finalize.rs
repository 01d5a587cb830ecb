//! The process-wide finalize-requested table
//!
//! When the last strong reference to a proxy drops, its identifier lands
//! here; the owning session's finalization pump sends the release once the
//! entry has sat untouched for the quiescence window. Re-receiving the
//! identifier inside that window cancels the entry, which is what makes
//! resurrection race-free: a release is only ever sent for an identifier
//! that was still dead when its entry was removed.

use crate::client::session::ClientCore;
use objex_wire::ObjectId;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

pub(crate) struct FinalizeEntry {
    pub session: Weak<ClientCore>,
    pub class: String,
    pub requested_at: Instant,
}

impl FinalizeEntry {
    fn belongs_to(&self, session: &ClientCore) -> bool {
        std::ptr::eq(self.session.as_ptr(), session)
    }
}

static FINALIZE_REQUESTED: Lazy<Mutex<HashMap<ObjectId, FinalizeEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Record that a proxy finalizer ran. Called from `Drop`.
pub(crate) fn request(id: ObjectId, entry: FinalizeEntry) {
    FINALIZE_REQUESTED.lock().unwrap().insert(id, entry);
}

/// Remove and return the entry for `id`, cancelling any queued release.
pub(crate) fn cancel(id: ObjectId) -> Option<FinalizeEntry> {
    FINALIZE_REQUESTED.lock().unwrap().remove(&id)
}

/// Identifiers owned by `session` whose entries are older than the
/// quiescence window. Entries whose session is gone are dropped here, since
/// there is no longer anywhere to send their release.
pub(crate) fn due(session: &ClientCore, quiescence: Duration) -> Vec<ObjectId> {
    let now = Instant::now();
    let mut table = FINALIZE_REQUESTED.lock().unwrap();

    table.retain(|_, entry| entry.session.strong_count() > 0);
    table
        .iter()
        .filter(|(_, entry)| {
            entry.belongs_to(session) && now.duration_since(entry.requested_at) >= quiescence
        })
        .map(|(id, _)| *id)
        .collect()
}

/// Drop every entry belonging to a closing session.
pub(crate) fn purge_session(session: &ClientCore) {
    let mut table = FINALIZE_REQUESTED.lock().unwrap();
    table.retain(|_, entry| !entry.belongs_to(session));
}

#[cfg(test)]
pub(crate) fn contains(id: ObjectId) -> bool {
    FINALIZE_REQUESTED.lock().unwrap().contains_key(&id)
}
