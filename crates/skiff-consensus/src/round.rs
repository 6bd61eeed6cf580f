//! Consensus rounds: the unit of replication.
//!
//! A round owns the mutable half of an in-flight operation (its callback
//! and term binding); the replicate message derived from it is immutable
//! and shared with the queue and the log.

use crate::error::{RaftError, Result};
use crate::types::{OpId, Payload, ReplicateMsg};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Invoked exactly once with the round's final status: `Ok` when the
/// operation committed, `Aborted` when it was truncated before commit, or
/// another terminal error when replication failed for good.
pub type ReplicatedCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// An accepted-but-not-yet-committed operation.
pub struct ConsensusRound {
    payload: Payload,
    id: Mutex<Option<OpId>>,
    /// Term this round was accepted in, or -1 if unbound. A round accepted
    /// in term T must replicate in term T or abort (TOCTOU guard: the
    /// submitter may lose and regain leadership between acceptance and
    /// replication).
    bound_term: AtomicI64,
    replicated_cb: Mutex<Option<ReplicatedCallback>>,
}

impl ConsensusRound {
    /// Leader-side constructor: the id is assigned later, at append time.
    pub fn new(payload: Payload, replicated_cb: Option<ReplicatedCallback>) -> Arc<Self> {
        Arc::new(ConsensusRound {
            payload,
            id: Mutex::new(None),
            bound_term: AtomicI64::new(-1),
            replicated_cb: Mutex::new(replicated_cb),
        })
    }

    /// Follower-side constructor for an operation received from the leader.
    pub fn for_follower(msg: &ReplicateMsg) -> Arc<Self> {
        Arc::new(ConsensusRound {
            payload: msg.payload.clone(),
            id: Mutex::new(Some(msg.id)),
            bound_term: AtomicI64::new(-1),
            replicated_cb: Mutex::new(None),
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn is_config_change(&self) -> bool {
        self.payload.is_config_change()
    }

    /// The assigned id, if replication has begun.
    pub fn id(&self) -> Option<OpId> {
        *self.id.lock()
    }

    pub(crate) fn assign_id(&self, id: OpId) {
        let mut slot = self.id.lock();
        debug_assert!(slot.is_none(), "round id assigned twice");
        *slot = Some(id);
    }

    /// Build the immutable replicate message for this round. For a config
    /// change the new config's opid_index becomes the round's own index,
    /// which is how a config is later identified as installed-by-this-entry.
    pub(crate) fn to_msg(&self) -> ReplicateMsg {
        let id = self.id().expect("round has no id assigned");
        let payload = match &self.payload {
            Payload::ChangeConfig {
                old_config,
                new_config,
            } => {
                let mut new_config = new_config.clone();
                new_config.opid_index = Some(id.index);
                Payload::ChangeConfig {
                    old_config: old_config.clone(),
                    new_config,
                }
            }
            other => other.clone(),
        };
        ReplicateMsg::new(id, payload)
    }

    /// Bind this round to `term`; it may not replicate under any other.
    pub fn bind_term(&self, term: u64) {
        let prev = self.bound_term.swap(term as i64, Ordering::SeqCst);
        debug_assert_eq!(prev, -1, "round bound to a term twice");
    }

    /// Verify the bound term still matches. A no-op for unbound rounds.
    pub fn check_bound_term(&self, current_term: u64) -> Result<()> {
        let bound = self.bound_term.load(Ordering::SeqCst);
        if bound != -1 && bound != current_term as i64 {
            return Err(RaftError::Aborted(format!(
                "round was bound to term {} but the term is now {}",
                bound, current_term
            )));
        }
        Ok(())
    }

    /// Install the callback for a round created via [`Self::for_follower`].
    pub fn set_replicated_cb(&self, cb: ReplicatedCallback) {
        let mut slot = self.replicated_cb.lock();
        debug_assert!(slot.is_none(), "replicated callback set twice");
        *slot = Some(cb);
    }

    /// Deliver the round's final status. The callback fires at most once;
    /// later calls are ignored so commit and shutdown paths cannot race a
    /// double notification.
    pub fn notify_replication_finished(&self, status: Result<()>) {
        let cb = self.replicated_cb.lock().take();
        if let Some(cb) = cb {
            cb(status);
        }
    }
}

impl std::fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("id", &self.id())
            .field("bound_term", &self.bound_term.load(Ordering::SeqCst))
            .field("config_change", &self.is_config_change())
            .finish()
    }
}
