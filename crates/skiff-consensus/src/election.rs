//! Leader election driver.
//!
//! A `LeaderElection` fans a RequestVote out to every voter, counts the
//! responses, and reports WON or LOST through a one-shot callback. When a
//! config change is in flight the candidacy must win a majority in *both*
//! the committed and the pending config; one counter runs per config.

use crate::config::RaftConfig;
use crate::peers::PeerProxy;
use crate::types::{PeerId, TabletId, VoteRequest};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// How the candidacy behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Peers refuse the vote while they believe a leader is alive.
    Normal,
    /// Straw poll: peers answer as for a real election but record nothing,
    /// and the candidate does not bump its term. Avoids term inflation from
    /// partitioned nodes.
    PreElection,
    /// Peers vote even if they believe a leader is alive; used for a
    /// graceful leader hand-off.
    ElectEvenIfLeaderAlive,
}

/// Why the election was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionReason {
    /// The committed config has a single voter, which elects itself at
    /// startup.
    InitialSingleNodeElection,
    /// The failure detector gave up on the current leader.
    ElectionTimeoutExpired,
    /// An explicit external request.
    ExternalRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionDecision {
    Won,
    Lost,
}

/// Outcome handed to the decision callback.
#[derive(Debug)]
pub struct ElectionResult {
    pub mode: ElectionMode,
    pub reason: ElectionReason,
    /// The term the candidate ran in (for a pre-election, the term it
    /// would have run in).
    pub candidate_term: u64,
    pub decision: ElectionDecision,
    /// Highest term seen in any response; a losing candidate adopts it.
    pub highest_voter_term: u64,
}

pub type ElectionDecisionCallback = Box<dyn FnOnce(ElectionResult) + Send + 'static>;

/// Tallies yes/no votes for one config's voter set.
pub(crate) struct VoteCounter {
    voters: HashSet<PeerId>,
    yes: HashSet<PeerId>,
    no: HashSet<PeerId>,
}

impl VoteCounter {
    pub(crate) fn new(voters: Vec<PeerId>) -> Self {
        VoteCounter {
            voters: voters.into_iter().collect(),
            yes: HashSet::new(),
            no: HashSet::new(),
        }
    }

    fn majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Record a vote. Votes from non-voters of this config are ignored, as
    /// are duplicates.
    pub(crate) fn register(&mut self, uuid: &PeerId, granted: bool) {
        if !self.voters.contains(uuid) || self.yes.contains(uuid) || self.no.contains(uuid) {
            return;
        }
        if granted {
            self.yes.insert(uuid.clone());
        } else {
            self.no.insert(uuid.clone());
        }
    }

    /// The tally's decision, once one is mathematically settled.
    pub(crate) fn decision(&self) -> Option<ElectionDecision> {
        if self.yes.len() >= self.majority() {
            Some(ElectionDecision::Won)
        } else if self.voters.len() - self.no.len() < self.majority() {
            Some(ElectionDecision::Lost)
        } else {
            None
        }
    }
}

/// One candidacy: a vote request, the voter proxies, and the counters.
pub struct LeaderElection {
    tablet_id: TabletId,
    mode: ElectionMode,
    reason: ElectionReason,
    request: VoteRequest,
    counters: Vec<VoteCounter>,
    /// Remote voters to ask, deduplicated across configs.
    voters: Vec<(PeerId, Arc<dyn PeerProxy>)>,
    rpc_timeout: Duration,
}

impl LeaderElection {
    /// `configs` is the committed config plus the pending config when one
    /// is in flight; the candidacy needs a majority in each.
    pub fn new(
        tablet_id: TabletId,
        mode: ElectionMode,
        reason: ElectionReason,
        request: VoteRequest,
        configs: Vec<RaftConfig>,
        voters: Vec<(PeerId, Arc<dyn PeerProxy>)>,
        rpc_timeout: Duration,
    ) -> Self {
        let counters = configs
            .iter()
            .map(|c| VoteCounter::new(c.voter_uuids()))
            .collect();
        LeaderElection {
            tablet_id,
            mode,
            reason,
            request,
            counters,
            voters,
            rpc_timeout,
        }
    }

    fn overall_decision(&self) -> Option<ElectionDecision> {
        if self
            .counters
            .iter()
            .any(|c| c.decision() == Some(ElectionDecision::Lost))
        {
            return Some(ElectionDecision::Lost);
        }
        if self
            .counters
            .iter()
            .all(|c| c.decision() == Some(ElectionDecision::Won))
        {
            return Some(ElectionDecision::Won);
        }
        None
    }

    /// Run the candidacy to a decision and hand it to `decision_cb`. The
    /// callback fires exactly once, as soon as the outcome is settled;
    /// stragglers' responses are discarded.
    pub async fn run(mut self, decision_cb: ElectionDecisionCallback) {
        let candidate = self.request.candidate_uuid.clone();
        for counter in &mut self.counters {
            counter.register(&candidate, true);
        }

        let mut highest_voter_term = 0;
        let mut decision = self.overall_decision();

        if decision.is_none() {
            let rpc_timeout = self.rpc_timeout;
            let mut in_flight: FuturesUnordered<_> = self
                .voters
                .drain(..)
                .map(|(uuid, proxy)| {
                    let request = self.request.clone();
                    async move {
                        let response = match tokio::time::timeout(
                            rpc_timeout,
                            proxy.request_vote(request),
                        )
                        .await
                        {
                            Ok(Ok(response)) => Some(response),
                            Ok(Err(_)) | Err(_) => None,
                        };
                        (uuid, response)
                    }
                })
                .collect();

            while let Some((uuid, response)) = in_flight.next().await {
                let granted = match response {
                    Some(response) => {
                        highest_voter_term = highest_voter_term.max(response.responder_term);
                        if let Some(error) = &response.error {
                            tracing::debug!(
                                tablet = %self.tablet_id,
                                voter = %uuid,
                                code = ?error.code,
                                "vote denied: {}",
                                error.message
                            );
                        }
                        response.vote_granted
                    }
                    // Unreachable voters count against the candidacy.
                    None => false,
                };
                for counter in &mut self.counters {
                    counter.register(&uuid, granted);
                }
                if let Some(settled) = self.overall_decision() {
                    decision = Some(settled);
                    break;
                }
            }
        }

        let decision = decision.unwrap_or(ElectionDecision::Lost);
        tracing::info!(
            tablet = %self.tablet_id,
            candidate = %candidate,
            term = self.request.candidate_term,
            mode = ?self.mode,
            decision = ?decision,
            "election decided"
        );
        decision_cb(ElectionResult {
            mode: self.mode,
            reason: self.reason,
            candidate_term: self.request.candidate_term,
            decision,
            highest_voter_term,
        });
    }
}
