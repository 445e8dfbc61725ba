use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::session::SessionHandle;

/// Write-once rendezvous cell yielding the paired session.
///
/// Both sides of a pairing hold clones of the same cell; whichever side
/// identifies last resolves it, and every waiter observes that one value. The
/// cell is never rejected, only potentially stale — staleness is handled by
/// slot re-validation at forward time, not here.
#[derive(Clone)]
pub struct PeerCell {
    tx: std::sync::Arc<watch::Sender<Option<SessionHandle>>>,
}

impl PeerCell {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    /// Resolve the cell. Returns false when it was already resolved.
    pub fn resolve(&self, peer: SessionHandle) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(peer);
                true
            }
        })
    }

    /// Current value without suspending.
    pub fn peek(&self) -> Option<SessionHandle> {
        self.tx.borrow().clone()
    }

    /// Suspend until the cell resolves. Returns None only if every clone of
    /// the cell has been dropped without a resolution.
    pub async fn wait(&self) -> Option<SessionHandle> {
        let mut rx = self.tx.subscribe();
        let resolved = match rx.wait_for(|peer| peer.is_some()).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        resolved
    }
}

impl Default for PeerCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps a slot id to the viewer session that claimed it.
///
/// Entries outlive the viewer's detach so completion reports keyed by the slot
/// still route afterwards; a sweep prunes detached entries once they have aged
/// past the retention window.
#[derive(Default)]
pub struct PairingTable {
    claims: HashMap<Uuid, ClaimEntry>,
}

struct ClaimEntry {
    viewer: SessionHandle,
    detached_at: Option<Instant>,
}

impl PairingTable {
    pub fn insert(&mut self, slot: Uuid, viewer: SessionHandle) {
        self.claims.insert(
            slot,
            ClaimEntry {
                viewer,
                detached_at: None,
            },
        );
    }

    /// The claiming viewer, attached or not. Slot ids are never reused, so a
    /// hit is always the session that started the recording.
    pub fn viewer_for(&self, slot: Uuid) -> Option<SessionHandle> {
        self.claims.get(&slot).map(|entry| entry.viewer.clone())
    }

    pub fn mark_detached(&mut self, slot: Uuid) {
        if let Some(entry) = self.claims.get_mut(&slot) {
            entry.detached_at = Some(Instant::now());
        }
    }

    /// Drop detached entries older than the retention window. Attached
    /// entries are never pruned.
    pub fn sweep(&mut self, retention: Duration) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, entry| match entry.detached_at {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - self.claims.len()
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionHandle;
    use tokio::sync::mpsc;

    fn session() -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle::new(tx)
    }

    #[tokio::test]
    async fn cell_resolves_exactly_once() {
        let cell = PeerCell::new();
        let first = session();
        let second = session();

        assert!(cell.resolve(first.clone()));
        assert!(!cell.resolve(second));

        let seen = cell.wait().await.expect("cell resolved");
        assert!(seen.same(&first));
        // Read-many: a second wait observes the same value.
        let again = cell.wait().await.expect("cell still resolved");
        assert!(again.same(&first));
    }

    #[tokio::test]
    async fn waiters_pending_before_resolution_all_wake() {
        let cell = PeerCell::new();
        let peer = session();

        let waiter_a = tokio::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });
        let waiter_b = tokio::spawn({
            let cell = cell.clone();
            async move { cell.wait().await }
        });

        cell.resolve(peer.clone());

        let got_a = waiter_a.await.unwrap().expect("waiter a resolved");
        let got_b = waiter_b.await.unwrap().expect("waiter b resolved");
        assert!(got_a.same(&peer));
        assert!(got_b.same(&peer));
    }

    #[test]
    fn peek_does_not_consume() {
        let cell = PeerCell::new();
        assert!(cell.peek().is_none());

        let peer = session();
        cell.resolve(peer.clone());
        assert!(cell.peek().expect("resolved").same(&peer));
        assert!(cell.peek().expect("still resolved").same(&peer));
    }

    #[test]
    fn sweep_prunes_only_aged_detached_entries() {
        let mut table = PairingTable::default();
        let attached = Uuid::new_v4();
        let detached = Uuid::new_v4();
        table.insert(attached, session());
        table.insert(detached, session());
        table.mark_detached(detached);

        // Generous retention keeps the freshly detached entry around.
        assert_eq!(table.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(table.len(), 2);

        // Zero retention prunes it, but never the attached one.
        assert_eq!(table.sweep(Duration::ZERO), 1);
        assert!(table.viewer_for(attached).is_some());
        assert!(table.viewer_for(detached).is_none());
    }
}
