//! Per-peer replication bookkeeping and the commit watermark.
//!
//! The queue tracks, for every member of the active config, how far that
//! peer has received and what it knows to be committed. Peer workers drain
//! it by asking for the next request to send and feeding responses back;
//! the queue recomputes the majority-replicated watermark on every
//! acknowledgement and reports movement to its observer.
//!
//! The observer is a non-owning back-edge into the consensus core. Its
//! methods are cheap dispatches: the core defers the real work to its own
//! execution context, so the queue's lock is never held into core logic.

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::log::Log;
use crate::options::RaftOptions;
use crate::types::{
    ConsensusErrorCode, OpId, PeerId, TabletId, UpdateRequest, UpdateResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Back-edge from the queue into the consensus core.
pub trait PeerMessageQueueObserver: Send + Sync {
    /// The majority-replicated watermark advanced to `commit_index`.
    fn notify_commit_index(&self, commit_index: u64);

    /// A peer responded with a term higher than the leader's.
    fn notify_term_change(&self, term: u64);

    /// A follower has had no successful exchange for longer than the
    /// configured unavailability timeout.
    fn notify_failed_follower(&self, uuid: &PeerId, term: u64, reason: String);
}

/// Replication progress for one tracked peer.
#[derive(Debug, Clone)]
pub struct TrackedPeer {
    pub uuid: PeerId,
    /// Highest op the peer acknowledged receiving from this leader; the
    /// peer's match index.
    pub last_received: OpId,
    /// Index of the next operation to send.
    pub next_index: u64,
    /// Committed index the peer last reported.
    pub last_known_committed_index: u64,
    /// Last op carried (or implied as preceding) by the most recent request
    /// built for this peer. On a success response the peer is known to hold
    /// everything up to here, even if it deduplicated the entries.
    last_sent: OpId,
    /// No exchange has succeeded yet; progress fields are optimistic
    /// guesses until the first response.
    pub is_new: bool,
    last_successful_exchange: Instant,
    failed_reported: bool,
}

enum QueueMode {
    NonLeader,
    Leader {
        term: u64,
        active_config: RaftConfig,
    },
}

struct QueueState {
    mode: QueueMode,
    peers: HashMap<PeerId, TrackedPeer>,
    /// Tail of the local log (durable).
    last_appended: OpId,
    /// Majority-replicated watermark, gated on current-term entries.
    committed_index: u64,
}

/// The outbound replication state for one replica.
pub struct PeerMessageQueue {
    tablet_id: TabletId,
    local_uuid: PeerId,
    log: Arc<dyn Log>,
    opts: RaftOptions,
    state: Mutex<QueueState>,
    observer: Mutex<Option<Weak<dyn PeerMessageQueueObserver>>>,
}

impl PeerMessageQueue {
    pub fn new(
        tablet_id: TabletId,
        local_uuid: PeerId,
        log: Arc<dyn Log>,
        opts: RaftOptions,
    ) -> Arc<Self> {
        Arc::new(PeerMessageQueue {
            tablet_id,
            local_uuid,
            log,
            opts,
            state: Mutex::new(QueueState {
                mode: QueueMode::NonLeader,
                peers: HashMap::new(),
                last_appended: OpId::MIN,
                committed_index: 0,
            }),
            observer: Mutex::new(None),
        })
    }

    /// Install the back-edge. Called once, before the replica starts.
    pub fn set_observer(&self, observer: Weak<dyn PeerMessageQueueObserver>) {
        *self.observer.lock() = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn PeerMessageQueueObserver>> {
        self.observer.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Seed the queue from bootstrap state.
    pub fn init(&self, last_appended: OpId, committed_index: u64) {
        let mut state = self.state.lock();
        state.last_appended = last_appended;
        state.committed_index = committed_index;
    }

    /// Switch to leader mode for `term`, tracking every member of
    /// `active_config`. Progress for peers already tracked is preserved so
    /// a config change mid-term does not reset replication.
    pub fn set_leader_mode(&self, term: u64, active_config: RaftConfig, committed_index: u64) {
        let mut state = self.state.lock();
        state.committed_index = state.committed_index.max(committed_index);
        let last_appended = state.last_appended;

        let mut peers = HashMap::new();
        for member in &active_config.members {
            let tracked = state.peers.remove(&member.uuid).unwrap_or_else(|| {
                let last_received = if member.uuid == self.local_uuid {
                    last_appended
                } else {
                    OpId::MIN
                };
                TrackedPeer {
                    uuid: member.uuid.clone(),
                    last_received,
                    next_index: last_appended.index + 1,
                    last_known_committed_index: 0,
                    is_new: member.uuid != self.local_uuid,
                    last_sent: OpId::MIN,
                    last_successful_exchange: Instant::now(),
                    failed_reported: false,
                }
            });
            peers.insert(member.uuid.clone(), tracked);
        }
        state.peers = peers;
        state.mode = QueueMode::Leader {
            term,
            active_config,
        };
        tracing::info!(
            tablet = %self.tablet_id,
            peer = %self.local_uuid,
            term,
            "queue entering leader mode"
        );
    }

    /// Stop building requests; drop per-peer state.
    pub fn set_non_leader_mode(&self) {
        let mut state = self.state.lock();
        state.mode = QueueMode::NonLeader;
        state.peers.clear();
    }

    /// The local log acknowledged `id` as durable. Advances the local
    /// peer's match index and possibly the watermark.
    pub fn local_peer_appended(&self, id: OpId) {
        {
            let mut state = self.state.lock();
            if id > state.last_appended {
                state.last_appended = id;
            }
            let local_uuid = self.local_uuid.clone();
            if let Some(local) = state.peers.get_mut(&local_uuid) {
                if id > local.last_received {
                    local.last_received = id;
                    local.next_index = id.index + 1;
                }
            }
        }
        self.maybe_advance_watermark();
    }

    /// The local log was truncated; `tail` is its new last entry.
    pub fn truncated_to(&self, tail: OpId) {
        let mut state = self.state.lock();
        state.last_appended = tail;
    }

    pub fn committed_index(&self) -> u64 {
        self.state.lock().committed_index
    }

    pub fn last_appended(&self) -> OpId {
        self.state.lock().last_appended
    }

    /// Snapshot of a tracked peer, for status surfaces and tests.
    pub fn tracked_peer(&self, uuid: &PeerId) -> Option<TrackedPeer> {
        self.state.lock().peers.get(uuid).cloned()
    }

    /// Smallest next-useful index across tracked peers, for the log GC
    /// `for_peers` hint.
    pub fn min_peer_retention_index(&self) -> u64 {
        let state = self.state.lock();
        state
            .peers
            .values()
            .map(|p| p.last_received.index + 1)
            .min()
            .unwrap_or(state.last_appended.index + 1)
    }

    /// Build the next Update request for `uuid`: entries from the peer's
    /// next-index (bounded by the batch limit), or an empty heartbeat when
    /// the peer is caught up.
    pub fn request_for_peer(&self, uuid: &PeerId) -> Result<UpdateRequest> {
        let (term, committed_index, next_index) = {
            let state = self.state.lock();
            let term = match &state.mode {
                QueueMode::Leader { term, .. } => *term,
                QueueMode::NonLeader => {
                    return Err(RaftError::NotLeader { leader: None });
                }
            };
            let peer = state.peers.get(uuid).ok_or_else(|| {
                RaftError::IllegalState(format!("peer {} is not tracked", uuid))
            })?;
            (term, state.committed_index, peer.next_index)
        };

        let preceding_index = next_index.saturating_sub(1);
        let preceding_op_id = self.log.op_id_at(preceding_index).ok_or_else(|| {
            // The entry before the peer's next index is gone from the log;
            // the peer can only catch up via a full tablet copy.
            RaftError::IllegalState(format!(
                "log entry {} needed for peer {} is no longer readable",
                preceding_index, uuid
            ))
        })?;

        // Read against the log tail rather than the durable watermark:
        // entries may ship to peers before the local fsync completes, and
        // the commit watermark still waits for the local ack.
        let ops: Vec<_> = if next_index <= self.log.last_op_id().index {
            self.log
                .read(preceding_index, self.opts.max_ops_per_update)?
                .iter()
                .map(|m| (**m).clone())
                .collect()
        } else {
            Vec::new()
        };

        let last_sent = ops.last().map(|m| m.id).unwrap_or(preceding_op_id);
        {
            let mut state = self.state.lock();
            if let Some(peer) = state.peers.get_mut(uuid) {
                peer.last_sent = last_sent;
            }
        }

        Ok(UpdateRequest {
            tablet_id: self.tablet_id.clone(),
            caller_uuid: self.local_uuid.clone(),
            term,
            preceding_op_id,
            ops,
            committed_index,
        })
    }

    /// Digest a peer's response. Returns true if the peer worker should
    /// immediately send another request (more entries, or a rewind to
    /// retry).
    pub fn response_from_peer(&self, uuid: &PeerId, response: &UpdateResponse) -> bool {
        let term = {
            let state = self.state.lock();
            match &state.mode {
                QueueMode::Leader { term, .. } => *term,
                QueueMode::NonLeader => return false,
            }
        };

        if response.responder_term > term {
            tracing::info!(
                tablet = %self.tablet_id,
                peer = %uuid,
                responder_term = response.responder_term,
                term,
                "peer responded with a higher term"
            );
            if let Some(observer) = self.observer() {
                observer.notify_term_change(response.responder_term);
            }
            return false;
        }

        let more = {
            let mut state = self.state.lock();
            let last_appended = state.last_appended;
            let peer = match state.peers.get_mut(uuid) {
                Some(p) => p,
                None => return false,
            };

            match &response.error {
                None => {
                    peer.last_successful_exchange = Instant::now();
                    peer.failed_reported = false;
                    peer.is_new = false;
                    // Success means the peer holds everything the request
                    // covered, whether it appended or deduplicated it.
                    let lrcl = response.status.last_received_current_leader;
                    let matched = lrcl.max(peer.last_sent);
                    if matched > peer.last_received {
                        peer.last_received = matched;
                    }
                    peer.next_index = peer.last_received.index + 1;
                    peer.last_known_committed_index = response.status.last_committed_idx;
                    peer.next_index <= last_appended.index
                }
                Some(e) if e.code == ConsensusErrorCode::PrecedingEntryDidntMatch => {
                    // The peer's log diverges or lags; rewind to what it
                    // reports and resend from there.
                    peer.last_successful_exchange = Instant::now();
                    peer.failed_reported = false;
                    let lrcl = response.status.last_received_current_leader;
                    peer.next_index = if lrcl.index > 0 {
                        lrcl.index + 1
                    } else {
                        response.status.last_received.index + 1
                    };
                    tracing::debug!(
                        tablet = %self.tablet_id,
                        peer = %uuid,
                        next_index = peer.next_index,
                        "rewinding peer after log-matching mismatch"
                    );
                    true
                }
                Some(e) => {
                    tracing::debug!(
                        tablet = %self.tablet_id,
                        peer = %uuid,
                        code = ?e.code,
                        "peer rejected update: {}",
                        e.message
                    );
                    false
                }
            }
        };

        self.maybe_advance_watermark();
        more
    }

    /// Record a failed exchange (transport error or timeout); reports the
    /// peer to the observer once it has been unreachable for the configured
    /// window.
    pub fn exchange_failed(&self, uuid: &PeerId) {
        let report = {
            let mut state = self.state.lock();
            let term = match &state.mode {
                QueueMode::Leader { term, .. } => *term,
                QueueMode::NonLeader => return,
            };
            match state.peers.get_mut(uuid) {
                Some(peer) => {
                    let down_for = peer.last_successful_exchange.elapsed();
                    if down_for > self.opts.follower_unavailable_timeout && !peer.failed_reported
                    {
                        peer.failed_reported = true;
                        Some((term, down_for))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        if let Some((term, down_for)) = report {
            if let Some(observer) = self.observer() {
                observer.notify_failed_follower(
                    uuid,
                    term,
                    format!("no successful exchange for {:?}", down_for),
                );
            }
        }
    }

    /// Recompute the majority watermark and notify the observer if it
    /// moved. Only entries of the leader's own term advance it (Raft §5.4);
    /// earlier-term entries commit transitively once the term-opening NO_OP
    /// is majority-replicated.
    fn maybe_advance_watermark(&self) {
        let (candidate, term) = {
            let state = self.state.lock();
            let (term, config) = match &state.mode {
                QueueMode::Leader {
                    term,
                    active_config,
                } => (*term, active_config),
                QueueMode::NonLeader => return,
            };
            let majority = config.majority_size();
            let mut matches: Vec<u64> = config
                .voters()
                .filter_map(|v| state.peers.get(&v.uuid))
                .map(|p| p.last_received.index)
                .collect();
            if matches.len() < majority {
                return;
            }
            matches.sort_unstable_by(|a, b| b.cmp(a));
            let candidate = matches[majority - 1];
            if candidate <= state.committed_index {
                return;
            }
            (candidate, term)
        };

        // Term gate, checked against the log outside the queue lock.
        match self.log.op_id_at(candidate) {
            Some(id) if id.term == term => {}
            _ => return,
        }

        let advanced = {
            let mut state = self.state.lock();
            match &state.mode {
                QueueMode::Leader { term: t, .. } if *t == term => {}
                _ => return,
            }
            if candidate > state.committed_index {
                state.committed_index = candidate;
                true
            } else {
                false
            }
        };

        if advanced {
            tracing::debug!(
                tablet = %self.tablet_id,
                peer = %self.local_uuid,
                commit_index = candidate,
                "majority watermark advanced"
            );
            if let Some(observer) = self.observer() {
                observer.notify_commit_index(candidate);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerInfo;
    use crate::log::MemLog;
    use crate::types::{ConsensusError, ConsensusStatus, Payload, ReplicateMsg};

    #[derive(Default)]
    struct RecordingObserver {
        commits: Mutex<Vec<u64>>,
        term_changes: Mutex<Vec<u64>>,
        failed: Mutex<Vec<PeerId>>,
    }

    impl PeerMessageQueueObserver for RecordingObserver {
        fn notify_commit_index(&self, commit_index: u64) {
            self.commits.lock().push(commit_index);
        }
        fn notify_term_change(&self, term: u64) {
            self.term_changes.lock().push(term);
        }
        fn notify_failed_follower(&self, uuid: &PeerId, _term: u64, _reason: String) {
            self.failed.lock().push(uuid.clone());
        }
    }

    fn three_voter_config() -> RaftConfig {
        RaftConfig::new(vec![
            PeerInfo::voter("a", "h1:1"),
            PeerInfo::voter("b", "h2:1"),
            PeerInfo::voter("c", "h3:1"),
        ])
    }

    fn success_response(uuid: &str, term: u64, lrcl: OpId, committed: u64) -> UpdateResponse {
        UpdateResponse {
            responder_uuid: PeerId::new(uuid),
            responder_term: term,
            status: ConsensusStatus {
                last_received: lrcl,
                last_received_current_leader: lrcl,
                last_committed_idx: committed,
            },
            error: None,
        }
    }

    async fn leader_queue() -> (Arc<PeerMessageQueue>, Arc<MemLog>, Arc<RecordingObserver>) {
        let log = MemLog::new();
        let msgs: Vec<_> = (1..=3)
            .map(|i| Arc::new(ReplicateMsg::new(OpId::new(2, i), Payload::NoOp)))
            .collect();
        log.append(msgs, Box::new(|_| {})).unwrap();

        let queue = PeerMessageQueue::new(
            TabletId::new("t1"),
            PeerId::new("a"),
            log.clone(),
            RaftOptions::default(),
        );
        let observer = Arc::new(RecordingObserver::default());
        let weak: Weak<dyn PeerMessageQueueObserver> = Arc::downgrade(&observer);
        queue.set_observer(weak);
        queue.init(OpId::new(2, 3), 0);
        queue.set_leader_mode(2, three_voter_config(), 0);
        queue.local_peer_appended(OpId::new(2, 3));
        (queue, log, observer)
    }

    #[tokio::test]
    async fn test_watermark_requires_majority() {
        let (queue, _log, observer) = leader_queue().await;
        // Local peer alone is not a majority of three.
        assert_eq!(queue.committed_index(), 0);

        let b = PeerId::new("b");
        queue.response_from_peer(&b, &success_response("b", 2, OpId::new(2, 2), 0));
        // a has 3, b has 2, c has 0: majority watermark is 2.
        assert_eq!(queue.committed_index(), 2);
        assert_eq!(*observer.commits.lock(), vec![2]);

        let c = PeerId::new("c");
        queue.response_from_peer(&c, &success_response("c", 2, OpId::new(2, 3), 0));
        assert_eq!(queue.committed_index(), 3);
        assert_eq!(*observer.commits.lock(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_watermark_gated_on_current_term_entries() {
        let log = MemLog::new();
        // Entries from term 1, but the queue leads term 2: replicating them
        // to a majority must not commit them until a term-2 entry lands.
        log.append(
            vec![
                Arc::new(ReplicateMsg::new(OpId::new(1, 1), Payload::NoOp)),
                Arc::new(ReplicateMsg::new(OpId::new(1, 2), Payload::NoOp)),
            ],
            Box::new(|_| {}),
        )
        .unwrap();
        let queue = PeerMessageQueue::new(
            TabletId::new("t1"),
            PeerId::new("a"),
            log.clone(),
            RaftOptions::default(),
        );
        queue.init(OpId::new(1, 2), 0);
        queue.set_leader_mode(2, three_voter_config(), 0);
        queue.local_peer_appended(OpId::new(1, 2));

        let b = PeerId::new("b");
        queue.response_from_peer(&b, &success_response("b", 2, OpId::new(1, 2), 0));
        assert_eq!(queue.committed_index(), 0);

        // The term-2 NO_OP arrives and replicates: everything commits.
        log.append(
            vec![Arc::new(ReplicateMsg::new(OpId::new(2, 3), Payload::NoOp))],
            Box::new(|_| {}),
        )
        .unwrap();
        queue.local_peer_appended(OpId::new(2, 3));
        queue.response_from_peer(&b, &success_response("b", 2, OpId::new(2, 3), 0));
        assert_eq!(queue.committed_index(), 3);
    }

    #[tokio::test]
    async fn test_request_for_peer_batches_and_heartbeats() {
        let (queue, _log, _observer) = leader_queue().await;
        let b = PeerId::new("b");

        let request = queue.request_for_peer(&b).unwrap();
        assert_eq!(request.term, 2);
        assert_eq!(request.preceding_op_id, OpId::new(2, 3));
        // Fresh peer is assumed caught up until the first response: this is
        // a heartbeat probing its actual position.
        assert!(request.ops.is_empty());

        // The peer reports it only has up to index 1.
        let rewind = UpdateResponse {
            responder_uuid: b.clone(),
            responder_term: 2,
            status: ConsensusStatus {
                last_received: OpId::new(2, 1),
                last_received_current_leader: OpId::new(2, 1),
                last_committed_idx: 0,
            },
            error: Some(ConsensusError::new(
                ConsensusErrorCode::PrecedingEntryDidntMatch,
                "no entry at preceding index",
            )),
        };
        assert!(queue.response_from_peer(&b, &rewind));
        let request = queue.request_for_peer(&b).unwrap();
        assert_eq!(request.preceding_op_id, OpId::new(2, 1));
        assert_eq!(request.ops.len(), 2);
        assert_eq!(request.ops[0].id, OpId::new(2, 2));
    }

    #[tokio::test]
    async fn test_higher_responder_term_notifies_observer() {
        let (queue, _log, observer) = leader_queue().await;
        let b = PeerId::new("b");
        let response = UpdateResponse {
            responder_uuid: b.clone(),
            responder_term: 5,
            status: ConsensusStatus::default(),
            error: Some(ConsensusError::new(
                ConsensusErrorCode::InvalidTerm,
                "stale leader",
            )),
        };
        assert!(!queue.response_from_peer(&b, &response));
        assert_eq!(*observer.term_changes.lock(), vec![5]);
    }

    #[tokio::test]
    async fn test_retention_tracks_slowest_peer() {
        let (queue, _log, _observer) = leader_queue().await;
        let b = PeerId::new("b");
        queue.response_from_peer(&b, &success_response("b", 2, OpId::new(2, 1), 0));
        // c has nothing yet: min(match)+1 == 1.
        assert_eq!(queue.min_peer_retention_index(), 1);
    }
}
