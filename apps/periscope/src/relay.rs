use metrics::counter;
use periscope_proto::ServerMessage;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::pairing::PeerCell;
use crate::session::SessionHandle;

/// Ordered relay path from one session towards its paired counterpart.
///
/// One lane exists per slot association. Messages queued before the pairing
/// resolves are buffered in arrival order and flushed once the counterpart is
/// known, so a sender's signaling stream is never reordered. Each forward
/// re-checks that the peer still carries the lane's slot; traffic for an
/// abandoned pairing is dropped, not delivered.
pub struct RelayLane {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl RelayLane {
    pub fn spawn(cell: PeerCell, slot_id: Uuid) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(cell, slot_id, rx));
        Self { tx }
    }

    /// Queue a message. Ordering is preserved per lane; delivery is best
    /// effort once the pairing resolves.
    pub fn forward(&self, msg: ServerMessage) {
        let _ = self.tx.send(msg);
    }
}

async fn run(cell: PeerCell, slot_id: Uuid, mut rx: mpsc::UnboundedReceiver<ServerMessage>) {
    let mut pending = Vec::new();
    let peer = loop {
        tokio::select! {
            resolved = cell.wait() => match resolved {
                Some(peer) => break peer,
                // Every clone of the cell is gone; nobody can resolve it.
                None => return,
            },
            queued = rx.recv() => match queued {
                Some(msg) => pending.push(msg),
                // Lane dropped before the pairing resolved.
                None => return,
            },
        }
    };

    for msg in pending {
        deliver(&peer, slot_id, msg);
    }
    while let Some(msg) = rx.recv().await {
        deliver(&peer, slot_id, msg);
    }
}

fn deliver(peer: &SessionHandle, slot_id: Uuid, msg: ServerMessage) {
    // The peer may have moved on to a different pairing since this message
    // was queued; stale traffic is silently dropped.
    if peer.slot() == Some(slot_id) {
        peer.send(msg);
    } else {
        counter!("periscope_relay_stale_dropped_total", 1);
        debug!(peer = %peer.id(), slot = %slot_id, "dropping relay message for stale pairing");
    }
}
