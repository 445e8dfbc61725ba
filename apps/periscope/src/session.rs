use std::sync::Arc;

use parking_lot::Mutex;
use periscope_proto::ServerMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pairing::PeerCell;
use crate::relay::RelayLane;

/// Role a session settles into after its identify message. Set exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Unclassified,
    PoolManager,
    Agent,
    Viewer,
}

/// Frames handed to the per-connection writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerMessage),
    /// Ask the writer to run the websocket close handshake and stop.
    Shutdown,
}

/// Shared handle to one live connection. Cheap to clone; every registry holds
/// one of these rather than the socket itself.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    tx: mpsc::UnboundedSender<Outbound>,
    link: Mutex<Link>,
}

/// Mutable half of a session: the role plus the current slot association.
/// For agents the slot is fixed at classification; for viewers it comes and
/// goes with each recording.
#[derive(Default)]
struct Link {
    role: Role,
    slot: Option<Uuid>,
    peer: Option<PeerCell>,
    lane: Option<RelayLane>,
}

impl SessionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                tx,
                link: Mutex::new(Link::default()),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn role(&self) -> Role {
        self.inner.link.lock().role
    }

    /// Classify the session. Returns false if a role was already assigned.
    pub fn set_role(&self, role: Role) -> bool {
        let mut link = self.inner.link.lock();
        if link.role != Role::Unclassified {
            return false;
        }
        link.role = role;
        true
    }

    pub fn slot(&self) -> Option<Uuid> {
        self.inner.link.lock().slot
    }

    pub fn peer_cell(&self) -> Option<PeerCell> {
        self.inner.link.lock().peer.clone()
    }

    /// Associate this session with a slot. The cell yields the counterpart
    /// session; the lane carries this session's relay traffic towards it.
    pub fn bind(&self, slot: Uuid, cell: PeerCell) {
        let lane = RelayLane::spawn(cell.clone(), slot);
        let mut link = self.inner.link.lock();
        link.slot = Some(slot);
        link.peer = Some(cell);
        link.lane = Some(lane);
    }

    /// Drop the slot association, handing back the cell so the caller can
    /// close an already-attached counterpart. Dropping the lane lets it drain
    /// and exit.
    pub fn unbind(&self) -> Option<(Uuid, PeerCell)> {
        let mut link = self.inner.link.lock();
        let slot = link.slot.take()?;
        let cell = link.peer.take();
        link.lane = None;
        cell.map(|cell| (slot, cell))
    }

    /// Queue a message for the paired session. Returns false when no pairing
    /// is active.
    pub fn relay(&self, msg: ServerMessage) -> bool {
        let link = self.inner.link.lock();
        match &link.lane {
            Some(lane) => {
                lane.forward(msg);
                true
            }
            None => false,
        }
    }

    /// Fire-and-forget write. A failed send means the writer is already gone
    /// and the connection is closing; the message is dropped.
    pub fn send(&self, msg: ServerMessage) {
        let _ = self.inner.tx.send(Outbound::Frame(msg));
    }

    pub fn close(&self) {
        let _ = self.inner.tx.send(Outbound::Shutdown);
    }

    pub fn same(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}
