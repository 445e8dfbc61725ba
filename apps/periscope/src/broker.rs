use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::Mutex;
use periscope_proto::{ClientMessage, ServerMessage, SocketKind};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pairing::{PairingTable, PeerCell};
use crate::pool::{AgentPool, RESERVE_TARGET};
use crate::session::{Role, SessionHandle};

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Fatal to the offending session only; its connection is closed.
    #[error("protocol violation: {0}")]
    Violation(&'static str),
    /// No slot ready. Reported to the viewer as a failed start, not a close.
    #[error("no agent slot available")]
    PoolExhausted,
    /// Agent identified for a slot its viewer already abandoned.
    #[error("slot abandoned by its viewer")]
    StaleSlot,
}

/// Coordinator owning the manager singleton, the slot reserve and the pairing
/// table. Every registry mutation happens under one lock, which is never held
/// across an await: checking for an existing binding and registering a new one
/// must be a single step or both sides of a pairing could miss each other.
#[derive(Clone)]
pub struct Broker {
    core: Arc<Mutex<Core>>,
    attach_timeout: Option<Duration>,
}

#[derive(Default)]
struct Core {
    manager: Option<SessionHandle>,
    pool: AgentPool,
    table: PairingTable,
}

impl Broker {
    pub fn new(attach_timeout: Option<Duration>) -> Self {
        Self {
            core: Arc::new(Mutex::new(Core::default())),
            attach_timeout,
        }
    }

    /// Assign a role based on the identify message. Each arm owns the
    /// role-specific admission rules.
    pub fn classify(
        &self,
        session: &SessionHandle,
        kind: SocketKind,
        slot_id: Option<Uuid>,
    ) -> Result<(), BrokerError> {
        match kind {
            SocketKind::PoolManager => self.classify_manager(session),
            SocketKind::Agent => self.classify_agent(session, slot_id),
            SocketKind::Viewer => {
                if !session.set_role(Role::Viewer) {
                    return Err(BrokerError::Violation("duplicate identify"));
                }
                info!(session = %session.id(), "viewer connected");
                Ok(())
            }
        }
    }

    fn classify_manager(&self, session: &SessionHandle) -> Result<(), BrokerError> {
        if !session.set_role(Role::PoolManager) {
            return Err(BrokerError::Violation("duplicate identify"));
        }
        let displaced = {
            let mut core = self.core.lock();
            let displaced = core.manager.replace(session.clone());
            // Slots spawned by a previous manager can no longer be honored.
            core.pool.clear();
            Self::refill_reserve(&mut core);
            displaced
        };
        match displaced {
            Some(old) => {
                warn!(old = %old.id(), new = %session.id(), "pool manager replaced");
                old.close();
            }
            None => info!(session = %session.id(), "pool manager connected"),
        }
        Ok(())
    }

    fn classify_agent(
        &self,
        session: &SessionHandle,
        slot_id: Option<Uuid>,
    ) -> Result<(), BrokerError> {
        let slot_id = slot_id.ok_or(BrokerError::Violation("agent identify without slot id"))?;
        if !session.set_role(Role::Agent) {
            return Err(BrokerError::Violation("duplicate identify"));
        }
        let mut core = self.core.lock();
        if let Some(viewer) = core.table.viewer_for(slot_id) {
            if viewer.slot() != Some(slot_id) {
                // The viewer stopped before this agent came up.
                return Err(BrokerError::StaleSlot);
            }
            // The agent is the later side; resolve both directions.
            let cell = PeerCell::new();
            cell.resolve(viewer.clone());
            session.bind(slot_id, cell);
            if let Some(viewer_cell) = viewer.peer_cell() {
                viewer_cell.resolve(session.clone());
            }
            counter!("periscope_pairings_resolved_total", 1);
            debug!(agent = %session.id(), viewer = %viewer.id(), slot = %slot_id, "pairing resolved");
            Ok(())
        } else if core.pool.attach(slot_id, session) {
            session.bind(slot_id, PeerCell::new());
            debug!(agent = %session.id(), slot = %slot_id, "agent attached to reserve slot");
            Ok(())
        } else {
            Err(BrokerError::Violation("identify for unknown slot"))
        }
    }

    /// Top the reserve back up to its target and ask the manager to spawn a
    /// process for each fresh slot. A no-op without a manager; nobody could
    /// honor the slots.
    fn refill_reserve(core: &mut Core) {
        let Some(manager) = core.manager.clone() else {
            return;
        };
        while core.pool.available() < RESERVE_TARGET {
            let slot_id = core.pool.replenish();
            manager.send(ServerMessage::SpawnSlot { slot_id });
        }
    }

    /// Claim a slot for the viewer, register the pairing, replenish the
    /// reserve and kick off the navigate handshake. Synchronous: the wait for
    /// the agent runs as its own task so the viewer's inbound loop is never
    /// blocked by an unresolved pairing.
    pub fn start_recording(
        &self,
        viewer: &SessionHandle,
        url: String,
    ) -> Result<(), BrokerError> {
        if viewer.slot().is_some() {
            return Err(BrokerError::Violation("recording already in progress"));
        }
        let (slot_id, cell) = {
            let mut core = self.core.lock();
            let slot = core.pool.claim().inspect_err(|_| {
                counter!("periscope_pool_exhausted_total", 1);
            })?;
            viewer.bind(slot.id, slot.agent.clone());
            core.table.insert(slot.id, viewer.clone());
            (slot.id, slot.agent)
        };
        {
            // Replenish runs as its own critical section; a concurrent claim
            // in the gap observes an exhausted pool and fails fast.
            let mut core = self.core.lock();
            Self::refill_reserve(&mut core);
        }
        info!(viewer = %viewer.id(), slot = %slot_id, url = %url, "recording started");
        self.spawn_navigate(viewer.clone(), slot_id, cell, url);
        Ok(())
    }

    /// Once the agent for a fresh claim attaches, resolve its side of the
    /// pairing and tell the manager where to point it.
    fn spawn_navigate(&self, viewer: SessionHandle, slot_id: Uuid, cell: PeerCell, url: String) {
        let broker = self.clone();
        tokio::spawn(async move {
            let attached = match broker.attach_timeout {
                Some(limit) => match tokio::time::timeout(limit, cell.wait()).await {
                    Ok(resolved) => resolved,
                    Err(_) => {
                        if broker.stop_claim(&viewer, Some(slot_id)) {
                            counter!("periscope_attach_timeouts_total", 1);
                            warn!(viewer = %viewer.id(), slot = %slot_id, "agent did not attach in time");
                            viewer.send(ServerMessage::Error {
                                message: "agent unavailable".into(),
                            });
                        }
                        return;
                    }
                },
                None => cell.wait().await,
            };
            let Some(agent) = attached else { return };
            let core = broker.core.lock();
            if viewer.slot() != Some(slot_id) {
                // The viewer moved on; the stale-claim check owns the agent.
                return;
            }
            if let Some(agent_cell) = agent.peer_cell() {
                if agent_cell.resolve(viewer.clone()) {
                    counter!("periscope_pairings_resolved_total", 1);
                    debug!(agent = %agent.id(), viewer = %viewer.id(), slot = %slot_id, "pairing resolved");
                }
            }
            if let Some(manager) = &core.manager {
                manager.send(ServerMessage::NavigateSlot { slot_id, url });
            }
        });
    }

    /// Unbind the viewer's slot and tear the agent side down. The pairing
    /// table entry stays behind, stamped, so late results keyed by the slot
    /// still route.
    pub fn stop_recording(&self, viewer: &SessionHandle) {
        self.stop_claim(viewer, None);
    }

    /// Stop logic proper. With `expected` set, only unbinds if the viewer is
    /// still on that exact slot; all bind/unbind transitions happen under the
    /// core lock, so the check cannot race a new claim.
    fn stop_claim(&self, viewer: &SessionHandle, expected: Option<Uuid>) -> bool {
        let mut core = self.core.lock();
        if expected.is_some() && viewer.slot() != expected {
            return false;
        }
        let Some((slot_id, cell)) = viewer.unbind() else {
            return false;
        };
        core.table.mark_detached(slot_id);
        if let Some(manager) = &core.manager {
            manager.send(ServerMessage::StopSlot { slot_id });
        }
        drop(core);
        info!(viewer = %viewer.id(), slot = %slot_id, "recording stopped");
        // An agent that already attached is torn down here; one still on its
        // way is closed by the stale-claim check when it identifies.
        if let Some(agent) = cell.peek() {
            agent.close();
        }
        true
    }

    /// Route a completion report from the manager to the claiming viewer,
    /// attached or not. Unknown slots are dropped.
    pub fn slot_result(&self, slot_id: Uuid, result: Value) {
        let viewer = self.core.lock().table.viewer_for(slot_id);
        match viewer {
            Some(viewer) => viewer.send(ServerMessage::SlotResult { slot_id, result }),
            None => debug!(slot = %slot_id, "dropping result for unknown slot"),
        }
    }

    /// Forward a viewer input event to the manager, re-tagged with the slot
    /// it concerns. Throttled input can trail a stop; without a bound slot it
    /// is dropped.
    pub fn forward_input(&self, viewer: &SessionHandle, input: ClientMessage) {
        let Some(slot_id) = viewer.slot() else {
            return;
        };
        let Some(manager) = self.core.lock().manager.clone() else {
            return;
        };
        let tagged = match input {
            ClientMessage::ResizeEvent { width, height } => ServerMessage::ResizeEvent {
                slot_id,
                width,
                height,
            },
            ClientMessage::MouseEvent { event_type, x, y } => ServerMessage::MouseEvent {
                slot_id,
                event_type,
                x,
                y,
            },
            ClientMessage::KeyboardEvent { event_type, key } => ServerMessage::KeyboardEvent {
                slot_id,
                event_type,
                key,
            },
            _ => return,
        };
        manager.send(tagged);
    }

    /// Close-time cleanup, dispatched on the session's settled role.
    pub fn session_closed(&self, session: &SessionHandle) {
        match session.role() {
            Role::Viewer => self.stop_recording(session),
            Role::PoolManager => {
                let mut core = self.core.lock();
                if core
                    .manager
                    .as_ref()
                    .is_some_and(|current| current.same(session))
                {
                    core.manager = None;
                    core.pool.clear();
                    warn!(session = %session.id(), "pool manager disconnected; reserve dropped");
                }
            }
            // Slot and table cleanup stays viewer-driven so late results
            // still route after an agent drops.
            Role::Agent | Role::Unclassified => {}
        }
    }

    pub fn sweep_claims(&self, retention: Duration) -> usize {
        let pruned = self.core.lock().table.sweep(retention);
        if pruned > 0 {
            counter!("periscope_claims_pruned_total", pruned as u64);
            debug!(pruned, "pruned detached pairing entries");
        }
        pruned
    }

    pub fn spawn_sweeper(&self, interval: Duration, retention: Duration) -> JoinHandle<()> {
        let broker = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                broker.sweep_claims(retention);
            }
        })
    }

    pub fn available_slots(&self) -> usize {
        self.core.lock().pool.available()
    }

    pub fn claim_entries(&self) -> usize {
        self.core.lock().table.len()
    }

    pub fn has_manager(&self) -> bool {
        self.core.lock().manager.is_some()
    }
}
