//! The consensus coordinator for one tablet replica.
//!
//! `RaftConsensus` owns the replica's role state and ties the
//! subcomponents together: durable metadata, the log, the pending-rounds
//! set, the peer message queue and its workers, the failure detector, and
//! the election driver. All mutable replica state lives behind one short
//! critical-section lock; an outer async lock serialises follower Update
//! processing end to end.
//!
//! Lock discipline:
//! - `update_lock` before `state` when both are taken;
//! - `state` is never held across an await, an I/O call, an RPC, or a
//!   callback into a collaborator;
//! - observer notifications from the queue are deferred onto their own
//!   tasks before touching replica state.

use crate::config::{role_of, RaftConfig, Role};
use crate::election::{
    ElectionDecision, ElectionMode, ElectionReason, ElectionResult, LeaderElection,
};
use crate::error::{RaftError, Result};
use crate::failure_detector::FailureDetector;
use crate::log::{Log, RetentionIndexes};
use crate::metadata::ConsensusMetadata;
use crate::options::RaftOptions;
use crate::peers::{PeerManager, PeerProxy, PeerProxyFactory};
use crate::pending::PendingRounds;
use crate::queue::{PeerMessageQueue, PeerMessageQueueObserver};
use crate::round::{ConsensusRound, ReplicatedCallback};
use crate::types::{
    ChangeConfigRequest, ChangeConfigType, ConsensusError, ConsensusErrorCode, ConsensusState,
    ConsensusStatus, OpId, OpIdType, Payload, PeerId, ReplicateMsg, TabletId, UpdateRequest,
    UpdateResponse, VoteRequest, VoteResponse,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Construction-time identity of the replica.
#[derive(Debug, Clone)]
pub struct ConsensusOptions {
    pub tablet_id: TabletId,
}

/// State recovered by the tablet bootstrap and handed to [`RaftConsensus::start`].
#[derive(Debug, Default)]
pub struct ConsensusBootstrapInfo {
    /// Id of the last operation in the log.
    pub last_id: OpId,
    /// Id of the last operation known committed.
    pub last_committed_id: OpId,
    /// Replicate messages found in the log with no commit record. They are
    /// re-registered as pending so the new term can resolve them.
    pub orphaned_replicates: Vec<ReplicateMsg>,
}

/// Factory for replica transactions.
///
/// Registered before consensus starts. When a follower accepts an operation
/// from the leader, consensus immediately stores it in the log and calls
/// `start_replica_transaction` to begin the asynchronous Prepare; the
/// factory later writes the commit record once Apply succeeds. Consensus
/// does not wait for Prepare before acknowledging the leader.
pub trait ReplicaTransactionFactory: Send + Sync {
    fn start_replica_transaction(&self, round: Arc<ConsensusRound>) -> Result<()>;
}

/// Replica lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Built but not started.
    Initialized,
    /// Accepting requests.
    Running,
    /// No new operations or commits accepted.
    ShuttingDown,
    /// Terminal.
    ShutDown,
}

struct ReplicaState {
    lifecycle: LifecycleState,
    /// Leader of the current term, if known. Cleared on term change.
    leader_uuid: Option<PeerId>,
    /// Last op appended from the current leader; resets when a new leader
    /// is recognised.
    last_received_cur_leader: OpId,
    /// Tail of the log (including enqueued appends).
    last_appended: OpId,
    /// Consecutive elections lost since we last saw a stable leader.
    failed_elections_since_stable_leader: u32,
    /// RequestVotes arriving before this instant are refused with
    /// LEADER_IS_ALIVE (unless the candidate asks to ignore live leaders).
    withhold_votes_until: Instant,
    /// An election driver is in flight.
    election_pending: bool,
    pending: PendingRounds,
}

/// Raft consensus replica for a single tablet.
pub struct RaftConsensus {
    options: ConsensusOptions,
    opts: RaftOptions,
    peer_uuid: PeerId,
    cmeta: Arc<ConsensusMetadata>,
    log: Arc<dyn Log>,
    txn_factory: Arc<dyn ReplicaTransactionFactory>,
    proxy_factory: Arc<dyn PeerProxyFactory>,
    queue: Arc<PeerMessageQueue>,
    peer_manager: Arc<PeerManager>,
    failure_detector: Arc<FailureDetector>,
    /// Serialises follower Update processing (outer lock).
    update_lock: tokio::sync::Mutex<()>,
    /// Protects all mutable replica state (inner lock).
    state: Mutex<ReplicaState>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_started: AtomicBool,
    weak_self: Weak<RaftConsensus>,
}

impl RaftConsensus {
    pub fn new(
        options: ConsensusOptions,
        opts: RaftOptions,
        cmeta: Arc<ConsensusMetadata>,
        log: Arc<dyn Log>,
        proxy_factory: Arc<dyn PeerProxyFactory>,
        txn_factory: Arc<dyn ReplicaTransactionFactory>,
    ) -> Arc<Self> {
        let peer_uuid = cmeta.self_uuid();
        let queue = PeerMessageQueue::new(
            options.tablet_id.clone(),
            peer_uuid.clone(),
            log.clone(),
            opts.clone(),
        );
        let peer_manager = PeerManager::new(
            options.tablet_id.clone(),
            peer_uuid.clone(),
            opts.clone(),
            queue.clone(),
            proxy_factory.clone(),
        );
        let failure_detector = FailureDetector::new(opts.clone());
        let (shutdown_tx, _) = broadcast::channel(4);

        let consensus = Arc::new_cyclic(|weak| RaftConsensus {
            options,
            opts,
            peer_uuid,
            cmeta,
            log,
            txn_factory,
            proxy_factory,
            queue: queue.clone(),
            peer_manager,
            failure_detector,
            update_lock: tokio::sync::Mutex::new(()),
            state: Mutex::new(ReplicaState {
                lifecycle: LifecycleState::Initialized,
                leader_uuid: None,
                last_received_cur_leader: OpId::MIN,
                last_appended: OpId::MIN,
                failed_elections_since_stable_leader: 0,
                withhold_votes_until: Instant::now(),
                election_pending: false,
                pending: PendingRounds::new(OpId::MIN),
            }),
            shutdown_tx,
            shutdown_started: AtomicBool::new(false),
            weak_self: weak.clone(),
        });

        let observer: Weak<dyn PeerMessageQueueObserver> = consensus.weak_self.clone();
        queue.set_observer(observer);
        consensus
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Start running the consensus algorithm.
    ///
    /// Validates the bootstrap state against the log, rebuilds the pending
    /// set from orphaned replicates (oldest first), arms failure detection,
    /// and, for a single-voter config, runs the initial election.
    pub async fn start(&self, bootstrap: ConsensusBootstrapInfo) -> Result<()> {
        self.opts
            .validate()
            .map_err(RaftError::IllegalState)?;

        let log_last = self.log.last_op_id();
        if log_last != bootstrap.last_id {
            return Err(RaftError::Corruption(format!(
                "bootstrap last op {} does not match log tail {}",
                bootstrap.last_id, log_last
            )));
        }
        if bootstrap.last_committed_id > bootstrap.last_id {
            return Err(RaftError::Corruption(format!(
                "bootstrap committed op {} is beyond the log tail {}",
                bootstrap.last_committed_id, bootstrap.last_id
            )));
        }

        {
            let mut s = self.state.lock();
            if s.lifecycle != LifecycleState::Initialized {
                return Err(RaftError::IllegalState(format!(
                    "cannot start replica in state {:?}",
                    s.lifecycle
                )));
            }
            s.last_appended = bootstrap.last_id;
            s.pending = PendingRounds::new(bootstrap.last_committed_id);
        }
        self.queue
            .init(bootstrap.last_id, bootstrap.last_committed_id.index);

        let mut orphans = bootstrap.orphaned_replicates;
        orphans.sort_by_key(|m| m.id.index);
        for msg in orphans {
            if msg.id.index <= bootstrap.last_committed_id.index {
                continue;
            }
            let round = ConsensusRound::for_follower(&msg);
            {
                let mut s = self.state.lock();
                self.add_pending_operation_locked(&mut s, &round)
                    .map_err(|e| {
                        RaftError::Corruption(format!(
                            "orphaned replicate {} cannot be re-registered: {}",
                            msg.id, e
                        ))
                    })?;
            }
            if matches!(round.payload(), Payload::Write(_)) {
                self.txn_factory.start_replica_transaction(round.clone())?;
            }
        }

        let weak = self.weak_self.clone();
        let on_failure: Box<dyn Fn() + Send + Sync> = Box::new(move || {
            if let Some(me) = weak.upgrade() {
                tokio::spawn(async move {
                    me.report_failure_detected().await;
                });
            }
        });
        tokio::spawn(
            self.failure_detector
                .clone()
                .run(on_failure, self.shutdown_tx.subscribe()),
        );

        {
            let mut s = self.state.lock();
            s.lifecycle = LifecycleState::Running;
            self.become_replica_locked(&mut s);
        }
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            term = self.cmeta.current_term(),
            "replica running"
        );

        let committed = self.cmeta.committed_config();
        if committed.is_sole_voter(&self.peer_uuid) && !self.cmeta.has_pending_config() {
            self.start_election(
                ElectionMode::Normal,
                ElectionReason::InitialSingleNodeElection,
            )
            .await?;
        }
        Ok(())
    }

    /// Stop the replica. Idempotent; in-flight RPCs observe the state flip
    /// and exit without mutating anything. Every still-pending round's
    /// callback fires with `Aborted`.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut s = self.state.lock();
            if s.lifecycle == LifecycleState::ShutDown {
                return;
            }
            s.lifecycle = LifecycleState::ShuttingDown;
        }
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            "shutting down"
        );
        let _ = self.shutdown_tx.send(());
        self.failure_detector.disable();
        self.queue.set_non_leader_mode();
        self.peer_manager.close().await;

        let aborted = {
            let mut s = self.state.lock();
            let committed = s.pending.last_committed().index;
            s.pending.abort_after(committed)
        };
        if aborted.iter().any(|r| r.is_config_change()) {
            self.cmeta.clear_pending_config();
        }
        for round in aborted {
            round.notify_replication_finished(Err(RaftError::Aborted(
                "replica is shutting down".into(),
            )));
        }
        {
            let mut s = self.state.lock();
            s.lifecycle = LifecycleState::ShutDown;
        }
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            "shut down"
        );
    }

    fn handle_fatal_error(&self, error: &RaftError) {
        tracing::error!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            "fatal consensus error, shutting down replica: {}",
            error
        );
        if let Some(me) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                me.shutdown().await;
            });
        }
    }

    async fn flush_cmeta_or_fatal(&self) -> Result<()> {
        match self.cmeta.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.handle_fatal_error(&e);
                Err(e)
            }
        }
    }

    // ---------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.state.lock().lifecycle == LifecycleState::Running
    }

    pub fn role(&self) -> Role {
        let s = self.state.lock();
        role_of(
            &self.peer_uuid,
            s.leader_uuid.as_ref(),
            &self.cmeta.active_config(),
        )
    }

    pub fn current_term(&self) -> u64 {
        self.cmeta.current_term()
    }

    pub fn peer_uuid(&self) -> &PeerId {
        &self.peer_uuid
    }

    pub fn tablet_id(&self) -> &TabletId {
        &self.options.tablet_id
    }

    pub fn leader_uuid(&self) -> Option<PeerId> {
        self.state.lock().leader_uuid.clone()
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.cmeta.committed_config()
    }

    pub fn consensus_state(&self) -> ConsensusState {
        let s = self.state.lock();
        ConsensusState {
            current_term: self.cmeta.current_term(),
            leader_uuid: s.leader_uuid.clone(),
            committed_config: self.cmeta.committed_config(),
            pending_config: self.cmeta.pending_config(),
        }
    }

    pub fn last_op_id(&self, kind: OpIdType) -> OpId {
        let s = self.state.lock();
        match kind {
            OpIdType::Received => s.last_appended,
            OpIdType::Committed => s.pending.last_committed(),
        }
    }

    /// Log indexes worth retaining: everything not yet fully committed, and
    /// preferably everything the slowest peer still needs.
    pub fn get_retention_indexes(&self) -> RetentionIndexes {
        let for_durability = {
            let s = self.state.lock();
            let committed = s.pending.last_committed().index;
            s.pending
                .earliest_pending_index()
                .map_or(committed, |earliest| committed.min(earliest))
        };
        RetentionIndexes {
            for_durability,
            for_peers: self.queue.min_peer_retention_index(),
        }
    }

    // ---------------------------------------------------------------
    // Internal helpers (locked)
    // ---------------------------------------------------------------

    fn check_running_locked(&self, s: &ReplicaState) -> Result<()> {
        if s.lifecycle != LifecycleState::Running {
            return Err(RaftError::ServiceUnavailable(format!(
                "replica is in state {:?}",
                s.lifecycle
            )));
        }
        Ok(())
    }

    fn is_leader_locked(&self, s: &ReplicaState) -> bool {
        s.leader_uuid.as_ref() == Some(&self.peer_uuid)
    }

    fn check_active_leader_locked(&self, s: &ReplicaState) -> Result<()> {
        if !self.is_leader_locked(s) {
            return Err(RaftError::NotLeader {
                leader: s.leader_uuid.clone(),
            });
        }
        Ok(())
    }

    /// Advance the term in memory: clears the vote and the known leader,
    /// and steps down if we were leading. The caller flushes afterwards,
    /// before taking any action under the new term.
    fn handle_term_advance_locked(&self, s: &mut ReplicaState, new_term: u64) {
        let current = self.cmeta.current_term();
        debug_assert!(new_term > current);
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            from = current,
            to = new_term,
            "advancing term"
        );
        let was_leader = self.is_leader_locked(s);
        self.cmeta.set_current_term(new_term);
        s.leader_uuid = None;
        if was_leader {
            self.become_replica_locked(s);
        }
    }

    fn become_replica_locked(&self, s: &mut ReplicaState) {
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            term = self.cmeta.current_term(),
            role = %role_of(&self.peer_uuid, s.leader_uuid.as_ref(), &self.cmeta.active_config()),
            "becoming replica"
        );
        if self.opts.enable_leader_failure_detection
            && self.cmeta.active_config().is_voter(&self.peer_uuid)
        {
            self.failure_detector.enable();
            self.failure_detector.snooze(Duration::ZERO);
        } else {
            self.failure_detector.disable();
        }
        self.queue.set_non_leader_mode();
        self.peer_manager.clear();
    }

    fn become_leader_locked(&self, s: &mut ReplicaState) -> Result<()> {
        let term = self.cmeta.current_term();
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            term,
            "becoming leader"
        );
        s.leader_uuid = Some(self.peer_uuid.clone());
        s.failed_elections_since_stable_leader = 0;
        self.failure_detector.disable();

        let active = self.cmeta.active_config();
        self.queue
            .set_leader_mode(term, active.clone(), s.pending.last_committed().index);
        self.peer_manager.update_config(&active)?;

        // Open the term with a NO_OP so outstanding previous-term entries
        // become committable.
        let round = ConsensusRound::new(Payload::NoOp, None);
        round.bind_term(term);
        self.append_new_round_locked(s, &round)?;
        Ok(())
    }

    /// Register a pending round. A config-change round installs its new
    /// config as pending the moment it is accepted, not at commit.
    fn add_pending_operation_locked(
        &self,
        s: &mut ReplicaState,
        round: &Arc<ConsensusRound>,
    ) -> Result<()> {
        if let Payload::ChangeConfig { new_config, .. } = round.payload() {
            if !self.cmeta.has_pending_config() {
                let mut config = new_config.clone();
                config.opid_index = round.id().map(|id| id.index);
                self.cmeta.set_pending_config(config)?;
            }
        }
        s.pending.add(round.clone())
    }

    /// Assign the next id, register the round, and enqueue the log append.
    /// The durability callback feeds the local peer's ack into the queue.
    fn append_new_round_locked(
        &self,
        s: &mut ReplicaState,
        round: &Arc<ConsensusRound>,
    ) -> Result<OpId> {
        let term = self.cmeta.current_term();
        let id = OpId::new(term, s.last_appended.index + 1);
        round.assign_id(id);
        self.add_pending_operation_locked(s, round)?;

        let msg = Arc::new(round.to_msg());
        let weak = self.weak_self.clone();
        let enqueued = self.log.append(
            vec![msg],
            Box::new(move |result| {
                if let Some(me) = weak.upgrade() {
                    match result {
                        Ok(()) => me.queue.local_peer_appended(id),
                        Err(e) => me.handle_fatal_error(&e),
                    }
                }
            }),
        );
        if let Err(e) = enqueued {
            // Keep the pending set in sync with the log: the round never
            // made it in, so it is not pending. For a config round the
            // staged pending config is rolled back by the caller.
            s.pending.abort_after(id.index.saturating_sub(1));
            return Err(e);
        }
        s.last_appended = id;
        Ok(id)
    }

    fn consensus_status_locked(&self, s: &ReplicaState) -> ConsensusStatus {
        ConsensusStatus {
            last_received: s.last_appended,
            last_received_current_leader: s.last_received_cur_leader,
            last_committed_idx: s.pending.last_committed().index,
        }
    }

    fn update_response_locked(
        &self,
        s: &ReplicaState,
        error: Option<ConsensusError>,
    ) -> UpdateResponse {
        UpdateResponse {
            responder_uuid: self.peer_uuid.clone(),
            responder_term: self.cmeta.current_term(),
            status: self.consensus_status_locked(s),
            error,
        }
    }

    // ---------------------------------------------------------------
    // Leader path
    // ---------------------------------------------------------------

    /// Create a round for [`Self::replicate`].
    pub fn new_round(
        &self,
        payload: Payload,
        replicated_cb: Option<ReplicatedCallback>,
    ) -> Arc<ConsensusRound> {
        ConsensusRound::new(payload, replicated_cb)
    }

    /// Verify we are the active leader and bind the round to the current
    /// term, so that a later [`Self::replicate`] fails instead of silently
    /// replicating under a different term.
    pub fn check_leadership_and_bind_term(&self, round: &Arc<ConsensusRound>) -> Result<()> {
        let s = self.state.lock();
        self.check_running_locked(&s)?;
        self.check_active_leader_locked(&s)?;
        round.bind_term(self.cmeta.current_term());
        Ok(())
    }

    /// Replicate an operation as leader. Returns as soon as the round is
    /// appended locally and queued to peers; the round's callback fires
    /// when it commits (or terminally fails).
    pub fn replicate(&self, round: Arc<ConsensusRound>) -> Result<()> {
        {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            self.check_active_leader_locked(&s)?;
            if round.id().is_some() {
                return Err(RaftError::IllegalState(
                    "round already has an assigned op id".into(),
                ));
            }
            // Leadership may have been lost and regained since the round
            // was accepted; we are not the leader of its bound term.
            if let Err(e) = round.check_bound_term(self.cmeta.current_term()) {
                tracing::info!(
                    tablet = %self.options.tablet_id,
                    peer = %self.peer_uuid,
                    "refusing to replicate round: {}",
                    e
                );
                return Err(RaftError::NotLeader {
                    leader: s.leader_uuid.clone(),
                });
            }
            self.append_new_round_locked(&mut s, &round)?;
        }
        self.peer_manager.signal_request_all();
        Ok(())
    }

    /// Resolve rounds the watermark has passed, in index order. Config
    /// rounds promote their config before the callback fires.
    async fn finish_committed_rounds(&self, rounds: Vec<Arc<ConsensusRound>>) {
        for round in rounds {
            if round.is_config_change() {
                self.complete_config_change_commit(&round).await;
            }
            round.notify_replication_finished(Ok(()));
        }
    }

    /// A config-change round committed: promote pending to committed,
    /// re-point replication at the committed config, and step down if we
    /// are no longer a voter.
    async fn complete_config_change_commit(&self, round: &Arc<ConsensusRound>) {
        let step_down = {
            let s = self.state.lock();
            let new_config = match round.payload() {
                Payload::ChangeConfig { new_config, .. } => {
                    let mut config = new_config.clone();
                    config.opid_index = round.id().map(|id| id.index);
                    config
                }
                _ => return,
            };
            tracing::info!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                config = %new_config,
                "config change committed"
            );
            self.cmeta.set_committed_config(new_config.clone());
            if self.is_leader_locked(&s) {
                if new_config.is_voter(&self.peer_uuid) {
                    self.queue.set_leader_mode(
                        self.cmeta.current_term(),
                        new_config.clone(),
                        s.pending.last_committed().index,
                    );
                    if let Err(e) = self.peer_manager.update_config(&new_config) {
                        tracing::warn!("failed to refresh peers after config change: {}", e);
                    }
                    false
                } else {
                    true
                }
            } else {
                false
            }
        };
        if step_down {
            let mut s = self.state.lock();
            tracing::info!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                "no longer a voter in the committed config; stepping down"
            );
            s.leader_uuid = None;
            self.become_replica_locked(&mut s);
        }
        let _ = self.flush_cmeta_or_fatal().await;
    }

    // ---------------------------------------------------------------
    // Observer back-edge (queue -> core)
    // ---------------------------------------------------------------

    async fn do_commit_advance(self: Arc<Self>, commit_index: u64) {
        let committed = {
            let mut s = self.state.lock();
            if s.lifecycle != LifecycleState::Running || !self.is_leader_locked(&s) {
                return;
            }
            let clamped = commit_index.min(s.pending.last_pending_index());
            let rounds = s.pending.advance_committed(clamped);
            if s.pending.is_empty() {
                s.failed_elections_since_stable_leader = 0;
            }
            rounds
        };
        if committed.is_empty() {
            return;
        }
        self.finish_committed_rounds(committed).await;
        // Let followers learn the new committed index promptly, and give
        // the log an updated GC floor.
        self.peer_manager.signal_request_all();
        self.log.set_retention(self.get_retention_indexes());
    }

    async fn do_term_change(self: Arc<Self>, term: u64) {
        let needs_flush = {
            let mut s = self.state.lock();
            if s.lifecycle != LifecycleState::Running {
                return;
            }
            if term > self.cmeta.current_term() {
                self.handle_term_advance_locked(&mut s, term);
                true
            } else {
                false
            }
        };
        if needs_flush {
            let _ = self.flush_cmeta_or_fatal().await;
        }
    }

    async fn do_failed_follower(self: Arc<Self>, uuid: PeerId, term: u64, reason: String) {
        let request = {
            let s = self.state.lock();
            if s.lifecycle != LifecycleState::Running
                || !self.is_leader_locked(&s)
                || self.cmeta.current_term() != term
                || self.cmeta.has_pending_config()
                || uuid == self.peer_uuid
            {
                return;
            }
            let committed = self.cmeta.committed_config();
            let peer = match committed.get_peer(&uuid) {
                Some(peer) => peer.clone(),
                None => return,
            };
            ChangeConfigRequest {
                tablet_id: self.options.tablet_id.clone(),
                change_type: ChangeConfigType::RemovePeer,
                peer,
                cas_config_opid_index: committed.opid_index,
            }
        };
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            follower = %uuid,
            "evicting failed follower: {}",
            reason
        );
        if let Err(e) = self.change_config(request) {
            tracing::warn!(
                tablet = %self.options.tablet_id,
                follower = %uuid,
                "failed to evict follower: {}",
                e
            );
        }
    }

    // ---------------------------------------------------------------
    // Follower path: Update
    // ---------------------------------------------------------------

    /// AppendEntries-equivalent. Serialised against concurrent Updates;
    /// returns once every accepted entry is durably logged and its Prepare
    /// dispatched.
    pub async fn update(&self, request: UpdateRequest) -> Result<UpdateResponse> {
        let _update_guard = self.update_lock.lock().await;
        self.update_replica(request).await
    }

    async fn update_replica(&self, request: UpdateRequest) -> Result<UpdateResponse> {
        // Phase 1: term handling, leader bookkeeping, dedup, log matching.
        // One short critical section; everything it decides is carried out
        // below, outside the lock.
        let phase1 = {
            let mut s = self.state.lock();
            match self.update_check_locked(&mut s, &request) {
                UpdateCheck::EarlyReturn(response) => return Ok(response),
                proceed => proceed,
            }
        };
        let (needs_flush, first_kept, mut truncate_idx, mismatch, deferred_check) = match phase1 {
            UpdateCheck::Proceed {
                needs_flush,
                first_kept,
                truncate_idx,
                mismatch,
                deferred_check,
            } => (needs_flush, first_kept, truncate_idx, mismatch, deferred_check),
            UpdateCheck::EarlyReturn(_) => unreachable!(),
        };

        // A term advance must be durable before we act under the new term.
        if needs_flush {
            self.flush_cmeta_or_fatal().await?;
        }

        // Verify a preceding op that falls at or below our committed index
        // against the log. A mismatch there means the protocol has been
        // violated; we refuse the request rather than rewrite history.
        if let Some(preceding) = deferred_check {
            match self.log.op_id_at(preceding.index) {
                Some(id) if id == preceding => {}
                None => {} // below the GC floor; committed on both ends
                Some(id) => {
                    tracing::error!(
                        tablet = %self.options.tablet_id,
                        peer = %self.peer_uuid,
                        "request preceding op {} contradicts committed entry {}",
                        preceding,
                        id
                    );
                    let s = self.state.lock();
                    return Ok(self.update_response_locked(
                        &s,
                        Some(ConsensusError::new(
                            ConsensusErrorCode::PrecedingEntryDidntMatch,
                            format!("committed entry at index {} has id {}", preceding.index, id),
                        )),
                    ));
                }
            }
        }

        if let Some(idx) = truncate_idx.take() {
            self.truncate_and_abort(idx)?;
        }

        if let Some(error) = mismatch {
            let s = self.state.lock();
            return Ok(self.update_response_locked(&s, Some(error)));
        }

        // Append phase: register rounds, enqueue the log write, dispatch
        // Prepares, then wait for durability.
        let kept: Vec<Arc<ReplicateMsg>> = match first_kept {
            Some(k) => request.ops[k..].iter().cloned().map(Arc::new).collect(),
            None => Vec::new(),
        };
        if !kept.is_empty() {
            let mut rounds = Vec::with_capacity(kept.len());
            let (durable_tx, durable_rx) = tokio::sync::oneshot::channel();
            {
                let mut s = self.state.lock();
                self.check_running_locked(&s)?;
                for msg in &kept {
                    let round = ConsensusRound::for_follower(msg);
                    self.add_pending_operation_locked(&mut s, &round)?;
                    rounds.push(round);
                }
                let last = kept.last().unwrap().id;
                let weak = self.weak_self.clone();
                self.log.append(
                    kept.clone(),
                    Box::new(move |result| {
                        if result.is_ok() {
                            if let Some(me) = weak.upgrade() {
                                me.queue.local_peer_appended(last);
                            }
                        }
                        let _ = durable_tx.send(result);
                    }),
                )?;
                s.last_appended = last;
                s.last_received_cur_leader = last;
            }

            for round in &rounds {
                if matches!(round.payload(), Payload::Write(_)) {
                    // The entry is already registered and logged; a Prepare
                    // that cannot start would strand it, so treat failure
                    // as fatal for the replica.
                    if let Err(e) = self.txn_factory.start_replica_transaction(round.clone()) {
                        self.handle_fatal_error(&e);
                        return Err(e);
                    }
                }
            }

            match durable_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handle_fatal_error(&e);
                    return Err(e);
                }
                Err(_) => {
                    return Err(RaftError::Aborted(
                        "log dropped the append acknowledgement".into(),
                    ));
                }
            }
        }

        // Commit advancement from the leader's watermark, clamped to what
        // we actually hold from this leader.
        let committed_rounds = {
            let mut s = self.state.lock();
            let ci = request
                .committed_index
                .min(s.last_received_cur_leader.index);
            s.pending.advance_committed(ci)
        };
        self.finish_committed_rounds(committed_rounds).await;

        let s = self.state.lock();
        Ok(self.update_response_locked(&s, None))
    }

    /// All of the Update decisions that happen under the state lock.
    fn update_check_locked(&self, s: &mut ReplicaState, request: &UpdateRequest) -> UpdateCheck {
        if s.lifecycle != LifecycleState::Running {
            return UpdateCheck::EarlyReturn(self.update_response_locked(
                s,
                Some(ConsensusError::new(
                    ConsensusErrorCode::TabletNotRunning,
                    format!("replica is in state {:?}", s.lifecycle),
                )),
            ));
        }

        // Term check.
        let current = self.cmeta.current_term();
        if request.term < current {
            return UpdateCheck::EarlyReturn(self.update_response_locked(
                s,
                Some(ConsensusError::new(
                    ConsensusErrorCode::InvalidTerm,
                    format!(
                        "request term {} is behind current term {}",
                        request.term, current
                    ),
                )),
            ));
        }
        let mut needs_flush = false;
        if request.term > current {
            self.handle_term_advance_locked(s, request.term);
            needs_flush = true;
        }

        // Record (or re-confirm) the leader for this term.
        if s.leader_uuid.as_ref() != Some(&request.caller_uuid) {
            if self.is_leader_locked(s) {
                // Same-term second leader cannot happen under election
                // safety; a higher term was handled above.
                self.become_replica_locked(s);
            }
            tracing::info!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                leader = %request.caller_uuid,
                term = self.cmeta.current_term(),
                "recognised leader"
            );
            s.leader_uuid = Some(request.caller_uuid.clone());
            s.last_received_cur_leader = OpId::MIN;
            s.failed_elections_since_stable_leader = 0;
        }

        // Valid leader contact: reset the election timer and withhold votes
        // from would-be disruptors for a failure-timeout window.
        self.failure_detector.snooze(Duration::ZERO);
        s.withhold_votes_until = Instant::now() + self.opts.leader_failure_timeout();

        // Deduplicate retransmissions: skip every op we already hold with
        // the same id; stop at the first genuinely new or conflicting one.
        let committed_index = s.pending.last_committed().index;
        let mut first_kept = None;
        for (i, msg) in request.ops.iter().enumerate() {
            if msg.id.index <= committed_index {
                continue;
            }
            match s.pending.round_at(msg.id.index) {
                Some(round) if round.id() == Some(msg.id) => continue,
                _ => {
                    first_kept = Some(i);
                    break;
                }
            }
        }
        let effective_preceding = match first_kept {
            Some(k) if k > 0 => request.ops[k - 1].id,
            Some(_) => request.preceding_op_id,
            None => request
                .ops
                .last()
                .map(|m| m.id)
                .unwrap_or(request.preceding_op_id),
        };

        // Log-matching property against the effective preceding op.
        let mut truncate_idx = None;
        let mut mismatch = None;
        let mut deferred_check = None;
        if effective_preceding != OpId::MIN {
            let preceding = effective_preceding;
            if preceding.index > s.last_appended.index {
                mismatch = Some(ConsensusError::new(
                    ConsensusErrorCode::PrecedingEntryDidntMatch,
                    format!(
                        "no entry at preceding index {}; log ends at {}",
                        preceding.index, s.last_appended
                    ),
                ));
            } else if preceding.index > committed_index {
                match s.pending.round_at(preceding.index) {
                    Some(round) if round.id() == Some(preceding) => {}
                    Some(round) => {
                        // Divergent suffix: drop our conflicting pending
                        // tail and tell the leader where to resume.
                        tracing::info!(
                            tablet = %self.options.tablet_id,
                            peer = %self.peer_uuid,
                            ours = %round.id().unwrap(),
                            theirs = %preceding,
                            "preceding op term mismatch; truncating"
                        );
                        truncate_idx = Some(preceding.index - 1);
                        mismatch = Some(ConsensusError::new(
                            ConsensusErrorCode::PrecedingEntryDidntMatch,
                            format!("term mismatch at preceding index {}", preceding.index),
                        ));
                    }
                    None => {
                        return UpdateCheck::EarlyReturn(self.update_response_locked(
                            s,
                            Some(ConsensusError::new(
                                ConsensusErrorCode::PrecedingEntryDidntMatch,
                                format!(
                                    "no pending round at index {} despite it being uncommitted",
                                    preceding.index
                                ),
                            )),
                        ));
                    }
                }
            } else {
                // At or below the committed index: verified against the log
                // outside the lock.
                deferred_check = Some(preceding);
            }
        }

        // Even with a matching preceding op, the first kept entry may
        // collide with a conflicting pending suffix (same index, different
        // term). Clear it before appending.
        if mismatch.is_none() && truncate_idx.is_none() {
            if let Some(k) = first_kept {
                let first = &request.ops[k];
                if first.id.index <= s.pending.last_pending_index() {
                    tracing::info!(
                        tablet = %self.options.tablet_id,
                        peer = %self.peer_uuid,
                        index = first.id.index,
                        "incoming entries conflict with pending suffix; truncating"
                    );
                    truncate_idx = Some(first.id.index - 1);
                }
            }
        }

        UpdateCheck::Proceed {
            needs_flush,
            first_kept,
            truncate_idx,
            mismatch,
            deferred_check,
        }
    }

    /// Truncate the log and abort the corresponding pending rounds.
    fn truncate_and_abort(&self, idx: u64) -> Result<()> {
        self.log.truncate_after(idx)?;
        let (aborted, new_tail) = {
            let mut s = self.state.lock();
            let aborted = s.pending.abort_after(idx);
            let new_tail = self.log.last_op_id();
            s.last_appended = new_tail;
            if s.last_received_cur_leader > new_tail {
                s.last_received_cur_leader = new_tail;
            }
            (aborted, new_tail)
        };
        self.queue.truncated_to(new_tail);
        if aborted.iter().any(|r| r.is_config_change()) {
            self.cmeta.clear_pending_config();
        }
        for round in aborted {
            round.notify_replication_finished(Err(RaftError::Aborted(format!(
                "op truncated after index {}",
                idx
            ))));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Vote server
    // ---------------------------------------------------------------

    /// Serve a RequestVote. Denials and grants are reported in the
    /// response; a granted real vote is durable before the response goes
    /// out.
    pub async fn request_vote(&self, request: VoteRequest) -> Result<VoteResponse> {
        // Held through the durable grant so a vote cannot interleave with
        // an in-flight update from a valid leader.
        let mut update_guard = None;

        let (verdict, needs_flush) = {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            let current = self.cmeta.current_term();

            // The whole ladder is evaluated before any side effect: the
            // candidate's term is adopted only on a grant or on a
            // too-old-log denial. A candidate refused because the leader
            // is alive (or because we are busy) must not move our term, or
            // a partitioned node's probes would disrupt a healthy cluster.
            if request.candidate_term < current {
                (
                    VerdictKind::Deny(
                        ConsensusErrorCode::InvalidTerm,
                        format!(
                            "candidate term {} is behind current term {}",
                            request.candidate_term, current
                        ),
                    ),
                    false,
                )
            } else if request.candidate_term == current && self.cmeta.has_voted_current_term() {
                let voted_for = self.cmeta.voted_for().unwrap();
                if voted_for == request.candidate_uuid {
                    (VerdictKind::GrantedAlready, false)
                } else {
                    (
                        VerdictKind::Deny(
                            ConsensusErrorCode::AlreadyVoted,
                            format!("already voted for {} in term {}", voted_for, current),
                        ),
                        false,
                    )
                }
            } else if request.candidate_last_op_id < s.last_appended {
                let mut needs_flush = false;
                if request.candidate_term > current && !request.is_pre_election {
                    self.handle_term_advance_locked(&mut s, request.candidate_term);
                    needs_flush = true;
                }
                (
                    VerdictKind::Deny(
                        ConsensusErrorCode::LastOpIdTooOld,
                        format!(
                            "candidate last op {} is behind ours {}",
                            request.candidate_last_op_id, s.last_appended
                        ),
                    ),
                    needs_flush,
                )
            } else if !request.ignore_live_leader && Instant::now() < s.withhold_votes_until {
                (
                    VerdictKind::Deny(
                        ConsensusErrorCode::LeaderIsAlive,
                        "heard from a live leader recently".to_string(),
                    ),
                    false,
                )
            } else if request.is_pre_election {
                (VerdictKind::GrantPre, false)
            } else {
                match self.update_lock.try_lock() {
                    Ok(guard) => {
                        update_guard = Some(guard);
                        let mut needs_flush = false;
                        if request.candidate_term > current {
                            self.handle_term_advance_locked(&mut s, request.candidate_term);
                            needs_flush = true;
                        }
                        self.cmeta.set_voted_for(request.candidate_uuid.clone());
                        (VerdictKind::Grant, needs_flush)
                    }
                    Err(_) => (
                        VerdictKind::Deny(
                            ConsensusErrorCode::Busy,
                            "servicing a concurrent update or vote".to_string(),
                        ),
                        false,
                    ),
                }
            }
        };

        // A term advance is durable even when the vote is denied, and a
        // granted vote is durable before we respond.
        let granted_real = matches!(verdict, VerdictKind::Grant);
        if needs_flush || granted_real {
            self.flush_cmeta_or_fatal().await?;
        }
        drop(update_guard);
        if granted_real {
            // Granting a vote concedes the leader may be gone; push our own
            // candidacy out accordingly.
            self.failure_detector.snooze(Duration::ZERO);
        }

        let responder_term = self.cmeta.current_term();
        let response = match verdict {
            VerdictKind::Deny(code, message) => {
                tracing::info!(
                    tablet = %self.options.tablet_id,
                    peer = %self.peer_uuid,
                    candidate = %request.candidate_uuid,
                    term = request.candidate_term,
                    pre_election = request.is_pre_election,
                    code = ?code,
                    "vote denied: {}",
                    message
                );
                VoteResponse {
                    responder_uuid: self.peer_uuid.clone(),
                    responder_term,
                    vote_granted: false,
                    error: Some(ConsensusError::new(code, message)),
                }
            }
            VerdictKind::GrantedAlready | VerdictKind::Grant | VerdictKind::GrantPre => {
                tracing::info!(
                    tablet = %self.options.tablet_id,
                    peer = %self.peer_uuid,
                    candidate = %request.candidate_uuid,
                    term = request.candidate_term,
                    pre_election = request.is_pre_election,
                    "vote granted"
                );
                VoteResponse {
                    responder_uuid: self.peer_uuid.clone(),
                    responder_term,
                    vote_granted: true,
                    error: None,
                }
            }
        };
        Ok(response)
    }

    // ---------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------

    /// Failure-detector callback: the leader has been quiet too long.
    pub async fn report_failure_detected(&self) {
        let mode = if self.opts.enable_pre_elections {
            ElectionMode::PreElection
        } else {
            ElectionMode::Normal
        };
        if let Err(e) = self
            .start_election(mode, ElectionReason::ElectionTimeoutExpired)
            .await
        {
            tracing::warn!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                "failed to start election on leader failure: {}",
                e
            );
        }
    }

    /// Trigger a leader election.
    pub async fn start_election(&self, mode: ElectionMode, reason: ElectionReason) -> Result<()> {
        let pre = mode == ElectionMode::PreElection;
        let (request, configs) = {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            let active = self.cmeta.active_config();
            if !active.is_voter(&self.peer_uuid) {
                return Err(RaftError::IllegalState(
                    "not a voter in the active config".into(),
                ));
            }
            if self.is_leader_locked(&s) && mode != ElectionMode::ElectEvenIfLeaderAlive {
                return Ok(());
            }
            if s.election_pending {
                return Ok(());
            }

            let candidate_term = self.cmeta.current_term() + 1;
            if !pre {
                self.handle_term_advance_locked(&mut s, candidate_term);
                self.cmeta.set_voted_for(self.peer_uuid.clone());
            }
            self.failure_detector.snooze(
                self.opts
                    .election_backoff_delta(s.failed_elections_since_stable_leader),
            );
            s.election_pending = true;

            let request = VoteRequest {
                tablet_id: self.options.tablet_id.clone(),
                candidate_uuid: self.peer_uuid.clone(),
                candidate_term,
                candidate_last_op_id: s.last_appended,
                is_pre_election: pre,
                ignore_live_leader: mode == ElectionMode::ElectEvenIfLeaderAlive,
            };
            let mut configs = vec![self.cmeta.committed_config()];
            if let Some(pending) = self.cmeta.pending_config() {
                configs.push(pending);
            }
            (request, configs)
        };

        if !pre {
            if let Err(e) = self.cmeta.flush().await {
                self.state.lock().election_pending = false;
                self.handle_fatal_error(&e);
                return Err(e);
            }
        }

        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            term = request.candidate_term,
            mode = ?mode,
            reason = ?reason,
            "starting election"
        );

        // Proxies for the union of remote voters across both configs.
        let mut seen = HashSet::new();
        let mut voters: Vec<(PeerId, Arc<dyn PeerProxy>)> = Vec::new();
        for config in &configs {
            for voter in config.voters() {
                if voter.uuid == self.peer_uuid || !seen.insert(voter.uuid.clone()) {
                    continue;
                }
                match self.proxy_factory.new_proxy(voter) {
                    Ok(proxy) => voters.push((voter.uuid.clone(), proxy)),
                    // Counts as an unreachable voter.
                    Err(e) => tracing::warn!(
                        tablet = %self.options.tablet_id,
                        voter = %voter.uuid,
                        "cannot build proxy for voter: {}",
                        e
                    ),
                }
            }
        }

        let election = LeaderElection::new(
            self.options.tablet_id.clone(),
            mode,
            reason,
            request,
            configs,
            voters,
            self.opts.rpc_timeout,
        );
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            election
                .run(Box::new(move |result| {
                    if let Some(me) = weak.upgrade() {
                        tokio::spawn(async move {
                            me.handle_election_result(result).await;
                        });
                    }
                }))
                .await;
        });
        Ok(())
    }

    async fn handle_election_result(self: Arc<Self>, result: ElectionResult) {
        enum FollowUp {
            RealElection(ElectionReason),
            SignalPeers,
            Nothing,
        }
        let mut needs_flush = false;
        let follow_up = {
            let mut s = self.state.lock();
            s.election_pending = false;
            if s.lifecycle != LifecycleState::Running {
                return;
            }
            if result.highest_voter_term > self.cmeta.current_term() {
                self.handle_term_advance_locked(&mut s, result.highest_voter_term);
                needs_flush = true;
            }
            let current = self.cmeta.current_term();
            match result.decision {
                ElectionDecision::Won => {
                    if result.mode == ElectionMode::PreElection {
                        if result.candidate_term == current + 1 {
                            FollowUp::RealElection(result.reason)
                        } else {
                            FollowUp::Nothing // stale straw poll
                        }
                    } else if result.candidate_term == current
                        && !self.is_leader_locked(&s)
                        && self.cmeta.active_config().is_voter(&self.peer_uuid)
                    {
                        match self.become_leader_locked(&mut s) {
                            Ok(()) => FollowUp::SignalPeers,
                            Err(e) => {
                                tracing::error!(
                                    tablet = %self.options.tablet_id,
                                    peer = %self.peer_uuid,
                                    "won the election but could not assume leadership: {}",
                                    e
                                );
                                FollowUp::Nothing
                            }
                        }
                    } else {
                        tracing::info!(
                            tablet = %self.options.tablet_id,
                            peer = %self.peer_uuid,
                            candidate_term = result.candidate_term,
                            current,
                            "discarding stale election win"
                        );
                        FollowUp::Nothing
                    }
                }
                ElectionDecision::Lost => {
                    s.failed_elections_since_stable_leader += 1;
                    self.failure_detector.snooze(
                        self.opts
                            .election_backoff_delta(s.failed_elections_since_stable_leader),
                    );
                    tracing::info!(
                        tablet = %self.options.tablet_id,
                        peer = %self.peer_uuid,
                        term = result.candidate_term,
                        failed = s.failed_elections_since_stable_leader,
                        "election lost"
                    );
                    FollowUp::Nothing
                }
            }
        };
        if needs_flush {
            let _ = self.flush_cmeta_or_fatal().await;
        }
        match follow_up {
            FollowUp::RealElection(reason) => {
                let _ = self.start_election(ElectionMode::Normal, reason).await;
            }
            FollowUp::SignalPeers => self.peer_manager.signal_request_all(),
            FollowUp::Nothing => {}
        }
    }

    /// Relinquish leadership on request.
    pub fn step_down(&self) -> Result<()> {
        let mut s = self.state.lock();
        self.check_running_locked(&s)?;
        self.check_active_leader_locked(&s)?;
        tracing::info!(
            tablet = %self.options.tablet_id,
            peer = %self.peer_uuid,
            term = self.cmeta.current_term(),
            "stepping down on request"
        );
        s.leader_uuid = None;
        self.become_replica_locked(&mut s);
        // Give another replica a head start on the next election.
        self.failure_detector
            .snooze(self.opts.jittered_failure_timeout());
        Ok(())
    }

    // ---------------------------------------------------------------
    // Configuration changes
    // ---------------------------------------------------------------

    /// Replicate a single-step membership change. Returns once the change
    /// is accepted and replicating; promotion to the committed config
    /// happens when the entry commits.
    pub fn change_config(&self, request: ChangeConfigRequest) -> Result<()> {
        {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            self.check_active_leader_locked(&s)?;
            if self.cmeta.has_pending_config() || s.pending.has_pending_config_round() {
                return Err(RaftError::ConfigChangePending);
            }
            let committed = self.cmeta.committed_config();
            if let Some(cas) = request.cas_config_opid_index {
                if committed.opid_index != Some(cas) {
                    return Err(RaftError::CasFailed {
                        expected: Some(cas),
                        actual: committed.opid_index,
                    });
                }
            }
            let new_config = build_new_config(&committed, &request)?;
            new_config.validate()?;
            RaftConfig::ensure_single_step(&committed, &new_config)?;

            tracing::info!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                change = ?request.change_type,
                target = %request.peer.uuid,
                new_config = %new_config,
                "replicating config change"
            );

            // The new config governs replication from the moment it is
            // accepted; only its commit is awaited.
            self.cmeta.set_pending_config(new_config.clone())?;
            self.queue.set_leader_mode(
                self.cmeta.current_term(),
                new_config.clone(),
                s.pending.last_committed().index,
            );
            let round = ConsensusRound::new(
                Payload::ChangeConfig {
                    old_config: committed,
                    new_config: new_config.clone(),
                },
                None,
            );
            round.bind_term(self.cmeta.current_term());
            let staged = self
                .peer_manager
                .update_config(&new_config)
                .and_then(|()| self.append_new_round_locked(&mut s, &round));
            if let Err(e) = staged {
                // Roll the staging back so the replica is not wedged with a
                // pending config that will never replicate.
                self.cmeta.clear_pending_config();
                let committed = self.cmeta.committed_config();
                self.queue.set_leader_mode(
                    self.cmeta.current_term(),
                    committed.clone(),
                    s.pending.last_committed().index,
                );
                let _ = self.peer_manager.update_config(&committed);
                return Err(e);
            }
        }
        self.peer_manager.signal_request_all();
        Ok(())
    }

    /// Rewrite the committed config locally, bypassing replication.
    ///
    /// Disaster recovery only: this can diverge replicas that are still
    /// alive, and must be invoked on a quorum of survivors independently.
    pub async fn unsafe_change_config(&self, new_config: RaftConfig) -> Result<()> {
        new_config.validate()?;
        {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            tracing::warn!(
                tablet = %self.options.tablet_id,
                peer = %self.peer_uuid,
                new_config = %new_config,
                "UNSAFE config rewrite, bypassing replication"
            );
            self.cmeta.clear_pending_config();
            self.cmeta.set_committed_config(new_config.clone());
            if self.is_leader_locked(&s) {
                if new_config.is_voter(&self.peer_uuid) {
                    self.queue.set_leader_mode(
                        self.cmeta.current_term(),
                        new_config.clone(),
                        s.pending.last_committed().index,
                    );
                    self.peer_manager.update_config(&new_config)?;
                } else {
                    s.leader_uuid = None;
                    self.become_replica_locked(&mut s);
                }
            }
        }
        self.flush_cmeta_or_fatal().await
    }

    // ---------------------------------------------------------------
    // Test hooks (gated behind RaftOptions::allow_emulated_elections)
    // ---------------------------------------------------------------

    /// Assert leadership without holding an election. Refused unless
    /// explicitly enabled; with failure detection active elsewhere in the
    /// cluster this can split-brain.
    pub async fn emulate_election(&self) -> Result<()> {
        if !self.opts.allow_emulated_elections {
            return Err(RaftError::IllegalState(
                "emulated elections are disabled; enable RaftOptions::allow_emulated_elections"
                    .into(),
            ));
        }
        {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            let new_term = self.cmeta.current_term() + 1;
            self.handle_term_advance_locked(&mut s, new_term);
            self.cmeta.set_voted_for(self.peer_uuid.clone());
            self.become_leader_locked(&mut s)?;
        }
        self.flush_cmeta_or_fatal().await?;
        self.peer_manager.signal_request_all();
        Ok(())
    }

    /// Advance the term out of band. Same gating as
    /// [`Self::emulate_election`].
    pub async fn advance_term_for_tests(&self, new_term: u64) -> Result<()> {
        if !self.opts.allow_emulated_elections {
            return Err(RaftError::IllegalState(
                "test term advancement is disabled; enable RaftOptions::allow_emulated_elections"
                    .into(),
            ));
        }
        {
            let mut s = self.state.lock();
            self.check_running_locked(&s)?;
            if new_term <= self.cmeta.current_term() {
                return Err(RaftError::IllegalState(format!(
                    "term {} is not ahead of current term {}",
                    new_term,
                    self.cmeta.current_term()
                )));
            }
            self.handle_term_advance_locked(&mut s, new_term);
        }
        self.flush_cmeta_or_fatal().await
    }
}

/// Verdict of the vote ladder. Lives outside the method so the borrowck
/// scoping of the update-lock guard stays simple.
enum VerdictKind {
    Deny(ConsensusErrorCode, String),
    GrantedAlready,
    GrantPre,
    Grant,
}

enum UpdateCheck {
    EarlyReturn(UpdateResponse),
    Proceed {
        needs_flush: bool,
        first_kept: Option<usize>,
        truncate_idx: Option<u64>,
        mismatch: Option<ConsensusError>,
        deferred_check: Option<OpId>,
    },
}

fn build_new_config(committed: &RaftConfig, request: &ChangeConfigRequest) -> Result<RaftConfig> {
    let mut config = committed.clone();
    config.opid_index = None;
    match request.change_type {
        ChangeConfigType::AddPeer => {
            if config.has_peer(&request.peer.uuid) {
                return Err(RaftError::InvalidConfig(format!(
                    "peer {} is already a member",
                    request.peer.uuid
                )));
            }
            if request.peer.addr.is_empty() {
                return Err(RaftError::InvalidConfig(format!(
                    "peer {} has no address",
                    request.peer.uuid
                )));
            }
            config.members.push(request.peer.clone());
        }
        ChangeConfigType::RemovePeer => {
            if !config.has_peer(&request.peer.uuid) {
                return Err(RaftError::InvalidConfig(format!(
                    "peer {} is not a member",
                    request.peer.uuid
                )));
            }
            config.members.retain(|p| p.uuid != request.peer.uuid);
        }
        ChangeConfigType::ModifyPeer => {
            let member = config
                .members
                .iter_mut()
                .find(|p| p.uuid == request.peer.uuid)
                .ok_or_else(|| {
                    RaftError::InvalidConfig(format!(
                        "peer {} is not a member",
                        request.peer.uuid
                    ))
                })?;
            member.member_type = request.peer.member_type;
            if !request.peer.addr.is_empty() {
                member.addr = request.peer.addr.clone();
            }
        }
    }
    Ok(config)
}

impl PeerMessageQueueObserver for RaftConsensus {
    fn notify_commit_index(&self, commit_index: u64) {
        if let Some(me) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                me.do_commit_advance(commit_index).await;
            });
        }
    }

    fn notify_term_change(&self, term: u64) {
        if let Some(me) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                me.do_term_change(term).await;
            });
        }
    }

    fn notify_failed_follower(&self, uuid: &PeerId, term: u64, reason: String) {
        let uuid = uuid.clone();
        if let Some(me) = self.weak_self.upgrade() {
            tokio::spawn(async move {
                me.do_failed_follower(uuid, term, reason).await;
            });
        }
    }
}

impl std::fmt::Debug for RaftConsensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftConsensus")
            .field("tablet_id", &self.options.tablet_id)
            .field("peer_uuid", &self.peer_uuid)
            .field("term", &self.cmeta.current_term())
            .finish()
    }
}

fn _debug_assert_send() {
    fn helper<T: Send>(_: T) {}
    fn check3(c: &RaftConsensus) {
        helper(c.start_election(ElectionMode::Normal, ElectionReason::ExternalRequest));
    }
    let _ = check3;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerInfo;
    use crate::log::MemLog;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct NoopTxnFactory;

    impl ReplicaTransactionFactory for NoopTxnFactory {
        fn start_replica_transaction(&self, _round: Arc<ConsensusRound>) -> Result<()> {
            Ok(())
        }
    }

    struct NullProxyFactory;

    impl PeerProxyFactory for NullProxyFactory {
        fn new_proxy(&self, _peer: &crate::config::PeerInfo) -> Result<Arc<dyn PeerProxy>> {
            Err(RaftError::Transport("no transport in unit tests".into()))
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    async fn build_replica(
        members: Vec<PeerInfo>,
        opts: RaftOptions,
    ) -> (Arc<RaftConsensus>, Arc<MemLog>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cmeta = ConsensusMetadata::create(
            dir.path(),
            TabletId::new("t1"),
            PeerId::new("a"),
            RaftConfig::new(members),
        )
        .await
        .unwrap();
        let log = MemLog::new();
        let consensus = RaftConsensus::new(
            ConsensusOptions {
                tablet_id: TabletId::new("t1"),
            },
            opts,
            cmeta,
            log.clone(),
            Arc::new(NullProxyFactory),
            Arc::new(NoopTxnFactory),
        );
        consensus
            .start(ConsensusBootstrapInfo::default())
            .await
            .unwrap();
        (consensus, log, dir)
    }

    async fn single_voter_leader() -> (Arc<RaftConsensus>, Arc<MemLog>, TempDir) {
        let (consensus, log, dir) =
            build_replica(vec![PeerInfo::voter("a", "h:1")], RaftOptions::default()).await;
        let c = consensus.clone();
        assert!(
            wait_until(
                move || c.role() == Role::Leader
                    && c.last_op_id(OpIdType::Committed).index >= 1,
                Duration::from_secs(5)
            )
            .await,
            "single voter did not elect itself"
        );
        (consensus, log, dir)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_single_voter_self_election() {
        let (consensus, log, _dir) = single_voter_leader().await;
        assert_eq!(consensus.current_term(), 1);
        // The term-opening NO_OP is committed at index 1.
        assert_eq!(consensus.last_op_id(OpIdType::Committed), OpId::new(1, 1));
        assert_eq!(log.op_ids(), vec![OpId::new(1, 1)]);
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replicate_commits_on_single_voter() {
        let (consensus, log, _dir) = single_voter_leader().await;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let round = consensus.new_round(
            Payload::Write(Bytes::from_static(b"x1")),
            Some(Box::new(move |status| {
                let _ = tx.send(status);
            })),
        );
        consensus.check_leadership_and_bind_term(&round).unwrap();
        consensus.replicate(round.clone()).unwrap();

        rx.await.unwrap().unwrap();
        assert_eq!(round.id(), Some(OpId::new(1, 2)));
        assert_eq!(consensus.last_op_id(OpIdType::Committed), OpId::new(1, 2));
        assert_eq!(log.op_ids(), vec![OpId::new(1, 1), OpId::new(1, 2)]);
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_replicate_rejected_on_follower() {
        let opts = RaftOptions {
            enable_leader_failure_detection: false,
            ..Default::default()
        };
        let (consensus, _log, _dir) = build_replica(
            vec![
                PeerInfo::voter("a", "h1:1"),
                PeerInfo::voter("b", "h2:1"),
                PeerInfo::voter("c", "h3:1"),
            ],
            opts,
        )
        .await;
        assert_eq!(consensus.role(), Role::Follower);

        let round = consensus.new_round(Payload::Write(Bytes::from_static(b"x")), None);
        assert!(matches!(
            consensus.check_leadership_and_bind_term(&round),
            Err(RaftError::NotLeader { .. })
        ));
        let round = consensus.new_round(Payload::Write(Bytes::from_static(b"x")), None);
        assert!(matches!(
            consensus.replicate(round),
            Err(RaftError::NotLeader { .. })
        ));
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_bound_term_guard_rejects_stale_round() {
        let opts = RaftOptions {
            allow_emulated_elections: true,
            ..Default::default()
        };
        let (consensus, _log, _dir) =
            build_replica(vec![PeerInfo::voter("a", "h:1")], opts).await;
        let c = consensus.clone();
        assert!(wait_until(move || c.role() == Role::Leader, Duration::from_secs(5)).await);

        // Accepted under the current term...
        let round = consensus.new_round(Payload::Write(Bytes::from_static(b"x")), None);
        consensus.check_leadership_and_bind_term(&round).unwrap();

        // ...but leadership is lost and regained before replication.
        consensus.emulate_election().await.unwrap();
        assert_eq!(consensus.role(), Role::Leader);
        assert!(matches!(
            consensus.replicate(round),
            Err(RaftError::NotLeader { .. })
        ));
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_aborts_pending_and_is_idempotent() {
        let opts = RaftOptions {
            enable_leader_failure_detection: false,
            allow_emulated_elections: true,
            ..Default::default()
        };
        let (consensus, _log, _dir) = build_replica(
            vec![
                PeerInfo::voter("a", "h1:1"),
                PeerInfo::voter("b", "h2:1"),
                PeerInfo::voter("c", "h3:1"),
            ],
            opts,
        )
        .await;
        consensus.emulate_election().await.unwrap();
        assert_eq!(consensus.role(), Role::Leader);

        // No reachable peers: this round can never commit.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let round = consensus.new_round(
            Payload::Write(Bytes::from_static(b"doomed")),
            Some(Box::new(move |status| {
                let _ = tx.send(status);
            })),
        );
        consensus.check_leadership_and_bind_term(&round).unwrap();
        consensus.replicate(round).unwrap();

        consensus.shutdown().await;
        assert!(matches!(rx.await.unwrap(), Err(RaftError::Aborted(_))));
        assert!(!consensus.is_running());

        // Second shutdown is a no-op.
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_emulate_election_gated_by_options() {
        let opts = RaftOptions {
            enable_leader_failure_detection: false,
            ..Default::default()
        };
        let (consensus, _log, _dir) = build_replica(
            vec![PeerInfo::voter("a", "h1:1"), PeerInfo::voter("b", "h2:1")],
            opts,
        )
        .await;
        assert!(matches!(
            consensus.emulate_election().await,
            Err(RaftError::IllegalState(_))
        ));
        assert!(matches!(
            consensus.advance_term_for_tests(5).await,
            Err(RaftError::IllegalState(_))
        ));
        consensus.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_retention_indexes_track_commit_and_pending() {
        let (consensus, log, _dir) = single_voter_leader().await;
        let retention = consensus.get_retention_indexes();
        assert_eq!(retention.for_durability, 1);

        // Commit advancement pushes the hint into the log as well.
        let (tx, rx) = tokio::sync::oneshot::channel();
        let round = consensus.new_round(
            Payload::Write(Bytes::from_static(b"x")),
            Some(Box::new(move |status| {
                let _ = tx.send(status);
            })),
        );
        consensus.check_leadership_and_bind_term(&round).unwrap();
        consensus.replicate(round).unwrap();
        rx.await.unwrap().unwrap();

        let log2 = log.clone();
        assert!(
            wait_until(
                move || log2.retention().for_durability == 2,
                Duration::from_secs(5)
            )
            .await
        );
        consensus.shutdown().await;
    }
}
