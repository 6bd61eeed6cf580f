//! Core consensus types: OpId, peer identifiers, RPC messages.

use crate::config::{PeerInfo, RaftConfig};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a log operation: a `(term, index)` pair.
///
/// OpIds are totally ordered, lexicographically on `(term, index)`. Two
/// replicas holding an entry with the same OpId hold the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    /// Sentinel ordering before every real operation. Index 0 never holds
    /// an entry; logs are 1-indexed.
    pub const MIN: OpId = OpId { term: 0, index: 0 };

    pub fn new(term: u64, index: u64) -> Self {
        OpId { term, index }
    }
}

impl Default for OpId {
    fn default() -> Self {
        OpId::MIN
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Unique identifier of a peer, assigned when the peer is created.
///
/// A string to support UUIDs or operator-assigned names; the consensus core
/// treats it as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a replication group (one tablet = one Raft group).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TabletId(pub String);

impl TabletId {
    pub fn new(id: impl Into<String>) -> Self {
        TabletId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Payload of a replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Term-opening marker appended by a new leader. Commits outstanding
    /// previous-term entries (Raft §5.4: a leader only marks entries
    /// committed via an entry of its own term).
    NoOp,

    /// Opaque tablet operation, interpreted by the apply pipeline.
    Write(Bytes),

    /// Single-step membership change. Takes effect as the active config as
    /// soon as it is accepted; promoted to committed when it commits.
    ChangeConfig {
        old_config: RaftConfig,
        new_config: RaftConfig,
    },
}

impl Payload {
    pub fn is_config_change(&self) -> bool {
        matches!(self, Payload::ChangeConfig { .. })
    }
}

/// A replicate message: an operation with its assigned OpId.
///
/// Immutable once built; shared between the pending set, the replication
/// queue, and the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub payload: Payload,
}

impl ReplicateMsg {
    pub fn new(id: OpId, payload: Payload) -> Self {
        ReplicateMsg { id, payload }
    }
}

/// Per-RPC consensus error codes, carried in the response rather than as
/// transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusErrorCode {
    /// The caller's term is behind the responder's.
    InvalidTerm,
    /// The candidate's last-logged OpId is older than the responder's.
    LastOpIdTooOld,
    /// The responder already voted for a different candidate this term.
    AlreadyVoted,
    /// The responder's log does not contain the request's preceding OpId.
    PrecedingEntryDidntMatch,
    /// The responder heard from a live leader recently.
    LeaderIsAlive,
    /// The responder is servicing a conflicting vote or update.
    Busy,
    /// The replica is not running (shutting down or not started).
    TabletNotRunning,
    /// The responder is not the leader.
    NotLeader,
    /// A configuration change is already in flight.
    ConfigAlreadyPending,
    /// The compare-and-set config opid index did not match.
    CasFailed,
    /// The proposed configuration is not a legal single-step change.
    InvalidConfig,
}

/// Error detail attached to an RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusError {
    pub code: ConsensusErrorCode,
    pub message: String,
}

impl ConsensusError {
    pub fn new(code: ConsensusErrorCode, message: impl Into<String>) -> Self {
        ConsensusError {
            code,
            message: message.into(),
        }
    }
}

/// Watermarks reported by a replica in every Update response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsensusStatus {
    /// Highest OpId in the responder's log, from any leader.
    pub last_received: OpId,

    /// Highest OpId appended from the *current* leader. Resets when a new
    /// leader is recognised, so the leader can track a contiguous watermark.
    pub last_received_current_leader: OpId,

    /// Highest index the responder knows to be committed.
    pub last_committed_idx: u64,
}

/// AppendEntries-equivalent request, leader to follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub tablet_id: TabletId,
    /// UUID of the calling leader.
    pub caller_uuid: PeerId,
    pub term: u64,
    /// Id of the entry immediately preceding `ops`, for the log-matching
    /// check. `OpId::MIN` when `ops` starts at index 1.
    pub preceding_op_id: OpId,
    /// Operations to replicate, in log order. Empty for a heartbeat.
    pub ops: Vec<ReplicateMsg>,
    /// The leader's committed index.
    pub committed_index: u64,
}

/// Response to an Update request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub responder_uuid: PeerId,
    pub responder_term: u64,
    pub status: ConsensusStatus,
    pub error: Option<ConsensusError>,
}

impl UpdateResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// RequestVote request, candidate to voter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub tablet_id: TabletId,
    pub candidate_uuid: PeerId,
    /// The term the candidate is running in. For a pre-election this is the
    /// term the candidate *would* run in; the responder does not adopt it.
    pub candidate_term: u64,
    /// The candidate's last-logged OpId, for the up-to-date comparison.
    pub candidate_last_op_id: OpId,
    /// Straw poll: answer as for a real election but record nothing.
    pub is_pre_election: bool,
    /// Grant even if a leader is believed alive (graceful hand-off).
    pub ignore_live_leader: bool,
}

/// Response to a RequestVote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub responder_uuid: PeerId,
    pub responder_term: u64,
    pub vote_granted: bool,
    pub error: Option<ConsensusError>,
}

/// Kind of single-step membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeConfigType {
    AddPeer,
    RemovePeer,
    ModifyPeer,
}

/// ChangeConfig request, issued against the leader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeConfigRequest {
    pub tablet_id: TabletId,
    pub change_type: ChangeConfigType,
    /// The peer being added, removed, or modified. For removal only the
    /// uuid is consulted.
    pub peer: PeerInfo,
    /// If set, the change only applies while the committed config's
    /// opid_index still equals this value.
    pub cas_config_opid_index: Option<u64>,
}

/// Snapshot of a replica's consensus state, for the tablet-server surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusState {
    pub current_term: u64,
    pub leader_uuid: Option<PeerId>,
    pub committed_config: RaftConfig,
    pub pending_config: Option<RaftConfig>,
}

/// Selector for [`crate::consensus::RaftConsensus::last_op_id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpIdType {
    /// Last operation appended to the log.
    Received,
    /// Last operation known committed.
    Committed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_id_ordering_is_lexicographic() {
        assert!(OpId::new(2, 1) > OpId::new(1, 9));
        assert!(OpId::new(3, 4) > OpId::new(3, 3));
        assert!(OpId::MIN < OpId::new(1, 1));
        assert_eq!(OpId::new(5, 7), OpId::new(5, 7));
    }

    #[test]
    fn test_op_id_display() {
        assert_eq!(OpId::new(3, 12).to_string(), "3.12");
    }

    #[test]
    fn test_payload_config_change_detection() {
        assert!(!Payload::NoOp.is_config_change());
        assert!(!Payload::Write(Bytes::from_static(b"x")).is_config_change());
    }
}
