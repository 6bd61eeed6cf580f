//! skiff-consensus: a per-tablet Raft consensus replica.
//!
//! Each replication group ("tablet") runs one [`RaftConsensus`] per member.
//! The replica coordinates its peers to produce a single durable, totally
//! ordered log of operations, surviving leader failure, partitions, and
//! single-step membership changes.
//!
//! The tablet server supplies the collaborators at the boundary:
//! - the operation log, behind [`log::Log`];
//! - the apply pipeline, behind [`consensus::ReplicaTransactionFactory`];
//! - the RPC transport, behind [`peers::PeerProxy`].

pub mod config;
pub mod consensus;
pub mod election;
pub mod error;
pub mod failure_detector;
pub mod log;
pub mod metadata;
pub mod options;
pub mod peers;
pub mod pending;
pub mod queue;
pub mod round;
pub mod types;

pub use config::{MemberType, PeerInfo, RaftConfig, Role};
pub use consensus::{
    ConsensusBootstrapInfo, ConsensusOptions, LifecycleState, RaftConsensus,
    ReplicaTransactionFactory,
};
pub use election::{ElectionMode, ElectionReason};
pub use error::{RaftError, Result};
pub use log::{Log, MemLog, RetentionIndexes};
pub use metadata::ConsensusMetadata;
pub use options::RaftOptions;
pub use peers::{PeerProxy, PeerProxyFactory};
pub use round::{ConsensusRound, ReplicatedCallback};
pub use types::{
    ChangeConfigRequest, ChangeConfigType, ConsensusError, ConsensusErrorCode, ConsensusState,
    ConsensusStatus, OpId, OpIdType, Payload, PeerId, ReplicateMsg, TabletId, UpdateRequest,
    UpdateResponse, VoteRequest, VoteResponse,
};
