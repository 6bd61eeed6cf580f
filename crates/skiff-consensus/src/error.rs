//! Consensus error types.

use crate::types::PeerId;
use thiserror::Error;

/// Errors surfaced by the consensus replica.
#[derive(Error, Debug)]
pub enum RaftError {
    /// The operation requires leadership this replica does not hold.
    #[error("not leader (known leader: {leader:?})")]
    NotLeader { leader: Option<PeerId> },

    /// The replica is not in a state or role that permits the operation.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The caller's term is behind ours.
    #[error("invalid term: request term {request} < current term {current}")]
    InvalidTerm { current: u64, request: u64 },

    /// A configuration change is already in flight.
    #[error("a configuration change is already pending")]
    ConfigChangePending,

    /// The compare-and-set opid index did not match the committed config.
    #[error("CAS failed: expected committed config opid_index {expected:?}, found {actual:?}")]
    CasFailed {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    /// The proposed configuration is invalid.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A pending operation was truncated or the replica shut down before
    /// the operation could commit.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The replica is shutting down or not yet running.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The log contradicts the consensus metadata. Fatal: the replica does
    /// not continue.
    #[error("corruption: {0}")]
    Corruption(String),

    /// An operation did not complete in time.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Transport-level failure talking to a peer.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: bincode::Error,
    },
}

/// Consensus result type.
pub type Result<T> = std::result::Result<T, RaftError>;
