use std::collections::VecDeque;

use uuid::Uuid;

use crate::broker::BrokerError;
use crate::pairing::PeerCell;
use crate::session::SessionHandle;

/// How many unclaimed slots the pool keeps warm. A fixed design parameter:
/// one slot hides the agent spawn latency from the next viewer without tying
/// up a fleet of idle processes.
pub const RESERVE_TARGET: usize = 1;

/// A reserved-but-unclaimed unit of agent capacity. The id exists before the
/// backing process does; the cell resolves once that process connects back
/// and identifies with it.
pub struct AgentSlot {
    pub id: Uuid,
    pub agent: PeerCell,
}

/// FIFO reserve of unclaimed slots. Owned exclusively by the broker; claimed
/// slots leave the pool and belong to the claiming viewer.
#[derive(Default)]
pub struct AgentPool {
    reserve: VecDeque<AgentSlot>,
}

impl AgentPool {
    /// Create one fresh slot and hand back its id so the caller can ask the
    /// manager to spawn the backing process.
    pub fn replenish(&mut self) -> Uuid {
        let slot = AgentSlot {
            id: Uuid::new_v4(),
            agent: PeerCell::new(),
        };
        let id = slot.id;
        self.reserve.push_back(slot);
        id
    }

    /// Pop the oldest unclaimed slot. Oldest first so a slot whose process is
    /// already spawning is not starved by newer ones.
    pub fn claim(&mut self) -> Result<AgentSlot, BrokerError> {
        self.reserve.pop_front().ok_or(BrokerError::PoolExhausted)
    }

    /// Attach an agent session to the reserve slot it was spawned for.
    /// Returns false when the slot is unknown (already claimed slots are
    /// matched through the pairing table instead).
    pub fn attach(&mut self, slot_id: Uuid, agent: &SessionHandle) -> bool {
        match self.reserve.iter().find(|slot| slot.id == slot_id) {
            Some(slot) => {
                slot.agent.resolve(agent.clone());
                true
            }
            None => false,
        }
    }

    /// Drop every unclaimed slot. Used when the owning manager goes away; a
    /// new manager cannot honor slot ids it never spawned.
    pub fn clear(&mut self) {
        self.reserve.clear();
    }

    pub fn available(&self) -> usize {
        self.reserve.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn agent() -> SessionHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        SessionHandle::new(tx)
    }

    #[test]
    fn replenish_adds_exactly_one_slot() {
        let mut pool = AgentPool::default();
        assert_eq!(pool.available(), 0);
        pool.replenish();
        assert_eq!(pool.available(), 1);
        pool.replenish();
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn claim_is_exclusive_and_fails_fast_when_empty() {
        let mut pool = AgentPool::default();
        let id = pool.replenish();

        let claimed = pool.claim().expect("one slot reserved");
        assert_eq!(claimed.id, id);

        // Same slot can never be claimed twice; the pool is now exhausted
        // until a replenish completes.
        assert!(matches!(pool.claim(), Err(BrokerError::PoolExhausted)));
        pool.replenish();
        let next = pool.claim().expect("replenished");
        assert_ne!(next.id, id);
    }

    #[test]
    fn claim_pops_the_oldest_slot_first() {
        let mut pool = AgentPool::default();
        let first = pool.replenish();
        let second = pool.replenish();

        assert_eq!(pool.claim().expect("first").id, first);
        assert_eq!(pool.claim().expect("second").id, second);
    }

    #[test]
    fn attach_resolves_the_reserve_cell_in_place() {
        let mut pool = AgentPool::default();
        let id = pool.replenish();
        let session = agent();

        assert!(pool.attach(id, &session));
        // Slot stays reserved until a viewer claims it.
        assert_eq!(pool.available(), 1);
        let slot = pool.claim().expect("still claimable");
        assert!(slot.agent.peek().expect("attached").same(&session));

        assert!(!pool.attach(Uuid::new_v4(), &session));
    }

    #[test]
    fn clear_abandons_unclaimed_slots() {
        let mut pool = AgentPool::default();
        pool.replenish();
        pool.replenish();
        pool.clear();
        assert_eq!(pool.available(), 0);
        assert!(matches!(pool.claim(), Err(BrokerError::PoolExhausted)));
    }
}
