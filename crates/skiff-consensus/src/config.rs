//! Raft membership configuration: peers, member types, quorum math.
//!
//! Configurations change one voter at a time (add, remove, promote, or
//! demote), so the majorities of any two successive committed configs
//! overlap and no joint-consensus machinery is needed.

use crate::error::{RaftError, Result};
use crate::types::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Membership kind of a peer within a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberType {
    /// Counts toward quorum for elections and commits.
    Voter,
    /// Receives replication but does not vote.
    NonVoter,
}

/// One member of a Raft config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub uuid: PeerId,
    /// `host:port` the transport resolves.
    pub addr: String,
    pub member_type: MemberType,
}

impl PeerInfo {
    pub fn voter(uuid: impl Into<String>, addr: impl Into<String>) -> Self {
        PeerInfo {
            uuid: PeerId::new(uuid),
            addr: addr.into(),
            member_type: MemberType::Voter,
        }
    }

    pub fn non_voter(uuid: impl Into<String>, addr: impl Into<String>) -> Self {
        PeerInfo {
            uuid: PeerId::new(uuid),
            addr: addr.into(),
            member_type: MemberType::NonVoter,
        }
    }
}

/// A Raft membership configuration.
///
/// `opid_index` is the log index of the CHANGE_CONFIG entry that installed
/// this config, or `None` for a bootstrap config that predates the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub opid_index: Option<u64>,
    pub members: Vec<PeerInfo>,
}

impl RaftConfig {
    pub fn new(members: Vec<PeerInfo>) -> Self {
        RaftConfig {
            opid_index: None,
            members,
        }
    }

    pub fn voters(&self) -> impl Iterator<Item = &PeerInfo> {
        self.members
            .iter()
            .filter(|p| p.member_type == MemberType::Voter)
    }

    pub fn voter_uuids(&self) -> Vec<PeerId> {
        self.voters().map(|p| p.uuid.clone()).collect()
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    /// Smallest number of voters that constitutes a majority.
    pub fn majority_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    pub fn get_peer(&self, uuid: &PeerId) -> Option<&PeerInfo> {
        self.members.iter().find(|p| &p.uuid == uuid)
    }

    pub fn has_peer(&self, uuid: &PeerId) -> bool {
        self.get_peer(uuid).is_some()
    }

    pub fn is_voter(&self, uuid: &PeerId) -> bool {
        self.get_peer(uuid)
            .map_or(false, |p| p.member_type == MemberType::Voter)
    }

    /// True if `uuid` is the one and only voter.
    pub fn is_sole_voter(&self, uuid: &PeerId) -> bool {
        self.voter_count() == 1 && self.is_voter(uuid)
    }

    /// Structural sanity: at least one voter, no duplicate uuids, no empty
    /// addresses.
    pub fn validate(&self) -> Result<()> {
        if self.voter_count() == 0 {
            return Err(RaftError::InvalidConfig(
                "config must contain at least one voter".into(),
            ));
        }
        let mut seen = HashSet::new();
        for peer in &self.members {
            if !seen.insert(&peer.uuid) {
                return Err(RaftError::InvalidConfig(format!(
                    "duplicate peer {} in config",
                    peer.uuid
                )));
            }
            if peer.addr.is_empty() {
                return Err(RaftError::InvalidConfig(format!(
                    "peer {} has an empty address",
                    peer.uuid
                )));
            }
        }
        Ok(())
    }

    /// Enforce the one-voter-at-a-time rule between two configs: the voter
    /// sets may differ by at most one uuid, and the member sets by at most
    /// one entry.
    pub fn ensure_single_step(old: &RaftConfig, new: &RaftConfig) -> Result<()> {
        let old_voters: HashSet<_> = old.voters().map(|p| &p.uuid).collect();
        let new_voters: HashSet<_> = new.voters().map(|p| &p.uuid).collect();
        let voter_delta =
            old_voters.symmetric_difference(&new_voters).count();
        if voter_delta > 1 {
            return Err(RaftError::InvalidConfig(format!(
                "config change alters {} voters; only one voter may change at a time",
                voter_delta
            )));
        }
        let old_members: HashSet<_> = old.members.iter().map(|p| &p.uuid).collect();
        let new_members: HashSet<_> = new.members.iter().map(|p| &p.uuid).collect();
        if old_members.symmetric_difference(&new_members).count() > 1 {
            return Err(RaftError::InvalidConfig(
                "config change alters more than one member".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for RaftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{opid_index: {:?}, members: [", self.opid_index)?;
        for (i, p) in self.members.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} ({:?})", p.uuid, p.member_type)?;
        }
        write!(f, "]}}")
    }
}

/// Role a replica plays for the current term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    /// Voting member awaiting or following a leader.
    Follower,
    /// Non-voting member receiving replication.
    Learner,
    /// Not a member of the active config.
    NonVoter,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Leader => "LEADER",
            Role::Follower => "FOLLOWER",
            Role::Learner => "LEARNER",
            Role::NonVoter => "NON_VOTER",
        };
        write!(f, "{}", s)
    }
}

/// Derive the role of `uuid` from the active config and the known leader.
pub fn role_of(uuid: &PeerId, leader_uuid: Option<&PeerId>, config: &RaftConfig) -> Role {
    match config.get_peer(uuid) {
        Some(peer) => {
            if leader_uuid == Some(uuid) {
                Role::Leader
            } else if peer.member_type == MemberType::Voter {
                Role::Follower
            } else {
                Role::Learner
            }
        }
        None => Role::NonVoter,
    }
}
