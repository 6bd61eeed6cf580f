//! Tracking of accepted-but-uncommitted rounds.
//!
//! Invariants, enforced on every mutation:
//! - indices form a contiguous run `(last_committed, last_pending]`;
//! - the set holds at most one config-change round.

use crate::error::{RaftError, Result};
use crate::round::ConsensusRound;
use crate::types::OpId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// In-memory index of operations appended to the log but not yet committed
/// (nor aborted), keyed by log index.
pub struct PendingRounds {
    rounds: BTreeMap<u64, Arc<ConsensusRound>>,
    last_committed: OpId,
    config_round_index: Option<u64>,
}

impl PendingRounds {
    pub fn new(last_committed: OpId) -> Self {
        PendingRounds {
            rounds: BTreeMap::new(),
            last_committed,
            config_round_index: None,
        }
    }

    pub fn last_committed(&self) -> OpId {
        self.last_committed
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    /// Index of the newest tracked operation, committed or pending.
    pub fn last_pending_index(&self) -> u64 {
        self.rounds
            .keys()
            .next_back()
            .copied()
            .unwrap_or(self.last_committed.index)
    }

    pub fn earliest_pending_index(&self) -> Option<u64> {
        self.rounds.keys().next().copied()
    }

    pub fn round_at(&self, index: u64) -> Option<&Arc<ConsensusRound>> {
        self.rounds.get(&index)
    }

    /// Register a newly appended round. Its index must extend the run by
    /// exactly one, and a second in-flight config change is refused.
    pub fn add(&mut self, round: Arc<ConsensusRound>) -> Result<()> {
        let id = round
            .id()
            .ok_or_else(|| RaftError::IllegalState("pending round has no id".into()))?;
        let expected = self.last_pending_index() + 1;
        if id.index != expected {
            return Err(RaftError::IllegalState(format!(
                "pending round {} breaks contiguity; expected index {}",
                id, expected
            )));
        }
        if round.is_config_change() {
            if self.config_round_index.is_some() {
                return Err(RaftError::IllegalState(
                    "a config-change round is already pending".into(),
                ));
            }
            self.config_round_index = Some(id.index);
        }
        self.rounds.insert(id.index, round);
        Ok(())
    }

    /// Pop every round with index at or below `committed_index`, in index
    /// order, advancing the committed watermark. Values at or below the
    /// current watermark are a no-op.
    pub fn advance_committed(&mut self, committed_index: u64) -> Vec<Arc<ConsensusRound>> {
        let mut committed = Vec::new();
        while let Some((&index, _)) = self.rounds.iter().next() {
            if index > committed_index {
                break;
            }
            let round = self.rounds.remove(&index).unwrap();
            let id = round.id().expect("tracked round has an id");
            self.last_committed = id;
            if self.config_round_index == Some(index) {
                self.config_round_index = None;
            }
            committed.push(round);
        }
        committed
    }

    /// Remove every round with index strictly greater than `index`,
    /// returning them newest-first so abort callbacks see dependents fail
    /// before the operations they depended on.
    pub fn abort_after(&mut self, index: u64) -> Vec<Arc<ConsensusRound>> {
        let removed = self.rounds.split_off(&(index + 1));
        if let Some(cfg_index) = self.config_round_index {
            if cfg_index > index {
                self.config_round_index = None;
            }
        }
        removed.into_values().rev().collect()
    }

    /// True if a config-change round is among the pending set.
    pub fn has_pending_config_round(&self) -> bool {
        self.config_round_index.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PeerInfo, RaftConfig};
    use crate::types::Payload;

    fn round(term: u64, index: u64) -> Arc<ConsensusRound> {
        let r = ConsensusRound::new(Payload::NoOp, None);
        r.assign_id(OpId::new(term, index));
        r
    }

    fn config_round(term: u64, index: u64) -> Arc<ConsensusRound> {
        let config = RaftConfig::new(vec![PeerInfo::voter("a", "h:1")]);
        let r = ConsensusRound::new(
            Payload::ChangeConfig {
                old_config: config.clone(),
                new_config: config,
            },
            None,
        );
        r.assign_id(OpId::new(term, index));
        r
    }

    #[test]
    fn test_contiguity_enforced() {
        let mut pending = PendingRounds::new(OpId::new(1, 2));
        pending.add(round(1, 3)).unwrap();
        pending.add(round(1, 4)).unwrap();
        // A gap is refused.
        assert!(pending.add(round(1, 6)).is_err());
        // So is a duplicate.
        assert!(pending.add(round(1, 4)).is_err());
        assert_eq!(pending.last_pending_index(), 4);
        assert_eq!(pending.earliest_pending_index(), Some(3));
    }

    #[test]
    fn test_advance_committed_in_order_and_idempotent() {
        let mut pending = PendingRounds::new(OpId::MIN);
        for i in 1..=4 {
            pending.add(round(1, i)).unwrap();
        }
        let committed = pending.advance_committed(3);
        let ids: Vec<u64> = committed.iter().map(|r| r.id().unwrap().index).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(pending.last_committed(), OpId::new(1, 3));

        // Re-delivering an older watermark commits nothing.
        assert!(pending.advance_committed(2).is_empty());
        assert!(pending.advance_committed(3).is_empty());
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn test_abort_after_returns_newest_first() {
        let mut pending = PendingRounds::new(OpId::MIN);
        for i in 1..=5 {
            pending.add(round(1, i)).unwrap();
        }
        let aborted = pending.abort_after(2);
        let ids: Vec<u64> = aborted.iter().map(|r| r.id().unwrap().index).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        assert_eq!(pending.last_pending_index(), 2);
        // The run stays contiguous after truncation.
        pending.add(round(2, 3)).unwrap();
    }

    #[test]
    fn test_single_pending_config_round() {
        let mut pending = PendingRounds::new(OpId::MIN);
        pending.add(config_round(1, 1)).unwrap();
        assert!(pending.has_pending_config_round());
        assert!(pending.add(config_round(1, 2)).is_err());

        // Committing the config round frees the slot.
        pending.advance_committed(1);
        assert!(!pending.has_pending_config_round());
        pending.add(config_round(1, 2)).unwrap();

        // Aborting it frees the slot too.
        let aborted = pending.abort_after(1);
        assert_eq!(aborted.len(), 1);
        assert!(!pending.has_pending_config_round());
    }
}
