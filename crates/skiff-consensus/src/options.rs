//! Replica tuning knobs.
//!
//! A plain configuration object passed at construction, rather than
//! process-wide flags, so two replicas in one process can run with
//! different timings.

use rand::Rng;
use std::time::Duration;

/// Timing and behaviour knobs for one replica.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    /// Base heartbeat period, leader to followers. Idle peers are woken at
    /// this interval even when there is nothing to send.
    ///
    /// Default: 150ms
    pub heartbeat_interval: Duration,

    /// A follower considers the leader failed after missing this many
    /// heartbeat periods, modulo jitter.
    ///
    /// Default: 3.0
    pub leader_failure_max_missed_heartbeat_periods: f64,

    /// Cap on the exponential election back-off added after repeated failed
    /// elections.
    ///
    /// Default: 10s
    pub leader_failure_exp_backoff_max_delta: Duration,

    /// Arm the leader-failure detector on non-leader replicas. Disabling
    /// this leaves election triggering to external requests only.
    ///
    /// Default: on
    pub enable_leader_failure_detection: bool,

    /// A follower with no successful exchange for this long is reported to
    /// the leader for eviction from the config.
    ///
    /// Default: 300s
    pub follower_unavailable_timeout: Duration,

    /// Maximum operations carried by one Update request.
    ///
    /// Default: 100
    pub max_ops_per_update: usize,

    /// Per-RPC timeout for consensus traffic (votes, updates).
    ///
    /// Default: 1s
    pub rpc_timeout: Duration,

    /// Run a non-durable pre-election before any failure-detector-triggered
    /// election. Keeps partitioned nodes from inflating their terms and
    /// disrupting a healthy cluster when they rejoin.
    ///
    /// Default: on
    pub enable_pre_elections: bool,

    /// Permit `emulate_election` / `advance_term_for_tests`. Never enable
    /// outside of tests: asserting leadership without votes can split-brain
    /// a cluster whose failure detection is active.
    ///
    /// Default: off
    pub allow_emulated_elections: bool,
}

impl Default for RaftOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            leader_failure_max_missed_heartbeat_periods: 3.0,
            leader_failure_exp_backoff_max_delta: Duration::from_secs(10),
            enable_leader_failure_detection: true,
            follower_unavailable_timeout: Duration::from_secs(300),
            max_ops_per_update: 100,
            rpc_timeout: Duration::from_secs(1),
            enable_pre_elections: true,
            allow_emulated_elections: false,
        }
    }
}

impl RaftOptions {
    /// Check invariants between the knobs.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must be non-zero".to_string());
        }
        if self.leader_failure_max_missed_heartbeat_periods < 1.0 {
            return Err(format!(
                "leader_failure_max_missed_heartbeat_periods ({}) must be >= 1.0",
                self.leader_failure_max_missed_heartbeat_periods
            ));
        }
        if self.max_ops_per_update == 0 {
            return Err("max_ops_per_update must be > 0".to_string());
        }
        Ok(())
    }

    /// Minimum time without leader contact before an election may trigger.
    /// Jitter and back-off only ever lengthen this.
    pub fn leader_failure_timeout(&self) -> Duration {
        self.heartbeat_interval
            .mul_f64(self.leader_failure_max_missed_heartbeat_periods)
    }

    /// Election timeout with fresh random jitter: `timeout * (1 + rand)`,
    /// `rand` uniform in `[0, 1)`. Each draw differs, de-synchronising
    /// candidates.
    pub fn jittered_failure_timeout(&self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.leader_failure_timeout().mul_f64(1.0 + jitter)
    }

    /// Additional snooze after `failed_elections` consecutive losses,
    /// growing exponentially and capped by
    /// `leader_failure_exp_backoff_max_delta`.
    pub fn election_backoff_delta(&self, failed_elections: u32) -> Duration {
        if failed_elections == 0 {
            return Duration::ZERO;
        }
        let exp = 1.1f64.powi(failed_elections.min(64) as i32) - 1.0;
        self.leader_failure_timeout()
            .mul_f64(exp)
            .min(self.leader_failure_exp_backoff_max_delta)
    }
}
