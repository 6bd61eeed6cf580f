//! Protocol-level tests of the follower Update path and the vote server,
//! driving a single replica with hand-built requests.

use bytes::Bytes;
use parking_lot::Mutex;
use skiff_consensus::{
    ConsensusBootstrapInfo, ConsensusErrorCode, ConsensusMetadata, ConsensusOptions,
    ConsensusRound, MemLog, OpId, OpIdType, Payload, PeerId, PeerInfo, PeerProxy,
    PeerProxyFactory, RaftConfig, RaftConsensus, RaftError, RaftOptions, ReplicateMsg,
    ReplicaTransactionFactory, Result, Role, TabletId, UpdateRequest, VoteRequest,
};
use std::sync::Arc;
use tempfile::TempDir;

struct NullProxyFactory;

impl PeerProxyFactory for NullProxyFactory {
    fn new_proxy(&self, _peer: &PeerInfo) -> Result<Arc<dyn PeerProxy>> {
        Err(RaftError::Transport("no transport in protocol tests".into()))
    }
}

/// Records the terminal status of every write round started on the replica.
#[derive(Default)]
struct ApplyRecorder {
    finished: Arc<Mutex<Vec<(OpId, bool)>>>,
}

impl ReplicaTransactionFactory for ApplyRecorder {
    fn start_replica_transaction(&self, round: Arc<ConsensusRound>) -> Result<()> {
        let finished = self.finished.clone();
        let round2 = round.clone();
        round.set_replicated_cb(Box::new(move |status| {
            finished
                .lock()
                .push((round2.id().unwrap(), status.is_ok()));
        }));
        Ok(())
    }
}

struct Fixture {
    consensus: Arc<RaftConsensus>,
    log: Arc<MemLog>,
    finished: Arc<Mutex<Vec<(OpId, bool)>>>,
    _dir: TempDir,
}

/// A follower replica "b" in config {a, b, c}, with failure detection off
/// so nothing runs elections behind the test's back.
async fn follower_fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = RaftConfig::new(vec![
        PeerInfo::voter("a", "127.0.0.1:7001"),
        PeerInfo::voter("b", "127.0.0.1:7002"),
        PeerInfo::voter("c", "127.0.0.1:7003"),
    ]);
    let cmeta = ConsensusMetadata::create(
        dir.path(),
        TabletId::new("tablet-1"),
        PeerId::new("b"),
        config,
    )
    .await
    .unwrap();
    let log = MemLog::new();
    let recorder = ApplyRecorder::default();
    let finished = recorder.finished.clone();
    let consensus = RaftConsensus::new(
        ConsensusOptions {
            tablet_id: TabletId::new("tablet-1"),
        },
        RaftOptions {
            enable_leader_failure_detection: false,
            ..Default::default()
        },
        cmeta,
        log.clone(),
        Arc::new(NullProxyFactory),
        Arc::new(recorder),
    );
    consensus
        .start(ConsensusBootstrapInfo::default())
        .await
        .unwrap();
    Fixture {
        consensus,
        log,
        finished,
        _dir: dir,
    }
}

fn write_op(term: u64, index: u64, payload: &[u8]) -> ReplicateMsg {
    ReplicateMsg::new(
        OpId::new(term, index),
        Payload::Write(Bytes::copy_from_slice(payload)),
    )
}

fn update_req(
    leader: &str,
    term: u64,
    preceding: OpId,
    ops: Vec<ReplicateMsg>,
    committed_index: u64,
) -> UpdateRequest {
    UpdateRequest {
        tablet_id: TabletId::new("tablet-1"),
        caller_uuid: PeerId::new(leader),
        term,
        preceding_op_id: preceding,
        ops,
        committed_index,
    }
}

fn vote_req(candidate: &str, term: u64, last_op: OpId) -> VoteRequest {
    VoteRequest {
        tablet_id: TabletId::new("tablet-1"),
        candidate_uuid: PeerId::new(candidate),
        candidate_term: term,
        candidate_last_op_id: last_op,
        is_pre_election: false,
        ignore_live_leader: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_appends_and_commits() {
    let fx = follower_fixture().await;
    let response = fx
        .consensus
        .update(update_req(
            "a",
            1,
            OpId::MIN,
            vec![write_op(1, 1, b"x1"), write_op(1, 2, b"x2")],
            1,
        ))
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(response.responder_term, 1);
    assert_eq!(response.status.last_received, OpId::new(1, 2));
    assert_eq!(response.status.last_received_current_leader, OpId::new(1, 2));
    assert_eq!(response.status.last_committed_idx, 1);

    assert_eq!(fx.consensus.role(), Role::Follower);
    assert_eq!(fx.consensus.leader_uuid(), Some(PeerId::new("a")));
    assert_eq!(fx.log.op_ids(), vec![OpId::new(1, 1), OpId::new(1, 2)]);
    // Index 1 committed and applied; index 2 still pending.
    assert_eq!(*fx.finished.lock(), vec![(OpId::new(1, 1), true)]);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_redelivery_is_idempotent() {
    let fx = follower_fixture().await;
    let request = update_req(
        "a",
        1,
        OpId::MIN,
        vec![write_op(1, 1, b"x1"), write_op(1, 2, b"x2")],
        0,
    );
    let first = fx.consensus.update(request.clone()).await.unwrap();
    let second = fx.consensus.update(request).await.unwrap();

    assert!(first.is_success());
    assert!(second.is_success());
    assert_eq!(first.status, second.status);
    // No duplicate entries were appended.
    assert_eq!(fx.log.op_ids(), vec![OpId::new(1, 1), OpId::new(1, 2)]);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_rejects_stale_term() {
    let fx = follower_fixture().await;
    // Term 2 established by a valid leader.
    fx.consensus
        .update(update_req("a", 2, OpId::MIN, vec![], 0))
        .await
        .unwrap();

    // A deposed term-1 leader retries.
    let response = fx
        .consensus
        .update(update_req("c", 1, OpId::MIN, vec![], 0))
        .await
        .unwrap();
    let error = response.error.expect("stale term must be rejected");
    assert_eq!(error.code, ConsensusErrorCode::InvalidTerm);
    assert_eq!(response.responder_term, 2);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_preceding_beyond_tail_reports_actual_position() {
    let fx = follower_fixture().await;
    let response = fx
        .consensus
        .update(update_req(
            "a",
            1,
            OpId::new(1, 5),
            vec![write_op(1, 6, b"x6")],
            0,
        ))
        .await
        .unwrap();

    let error = response.error.expect("gap must be rejected");
    assert_eq!(error.code, ConsensusErrorCode::PrecedingEntryDidntMatch);
    // The leader rewinds its next-index from this.
    assert_eq!(response.status.last_received, OpId::MIN);
    assert!(fx.log.op_ids().is_empty());
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_log_matching_repair_replaces_stale_suffix() {
    let fx = follower_fixture().await;

    // B ends up with [(1,1), (1,2), (2,3)]: two committed entries and a
    // stale uncommitted one from a term-2 leader that died.
    fx.consensus
        .update(update_req(
            "a",
            1,
            OpId::MIN,
            vec![write_op(1, 1, b"x1"), write_op(1, 2, b"x2")],
            0,
        ))
        .await
        .unwrap();
    fx.consensus
        .update(update_req(
            "a",
            2,
            OpId::new(1, 2),
            vec![write_op(2, 3, b"stale")],
            2,
        ))
        .await
        .unwrap();
    assert_eq!(fx.consensus.last_op_id(OpIdType::Received), OpId::new(2, 3));
    assert_eq!(fx.consensus.last_op_id(OpIdType::Committed), OpId::new(1, 2));

    // New leader C at term 3 carries (3,3) instead.
    let response = fx
        .consensus
        .update(update_req(
            "c",
            3,
            OpId::new(1, 2),
            vec![write_op(3, 3, b"x3")],
            2,
        ))
        .await
        .unwrap();

    assert!(response.is_success(), "repair should succeed: {:?}", response.error);
    assert_eq!(response.status.last_received, OpId::new(3, 3));
    assert_eq!(
        fx.log.op_ids(),
        vec![OpId::new(1, 1), OpId::new(1, 2), OpId::new(3, 3)]
    );
    // The stale round was aborted; no orphaned pending entry remains.
    let finished = fx.finished.lock().clone();
    assert!(finished.contains(&(OpId::new(2, 3), false)));
    assert_eq!(fx.consensus.last_op_id(OpIdType::Received), OpId::new(3, 3));
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_update_commit_index_clamped_to_received() {
    let fx = follower_fixture().await;
    // The leader claims a committed index far beyond what it sent us.
    let response = fx
        .consensus
        .update(update_req(
            "a",
            1,
            OpId::MIN,
            vec![write_op(1, 1, b"x1")],
            100,
        ))
        .await
        .unwrap();
    assert!(response.is_success());
    assert_eq!(response.status.last_committed_idx, 1);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vote_invalid_term() {
    let fx = follower_fixture().await;
    fx.consensus
        .update(update_req("a", 3, OpId::MIN, vec![], 0))
        .await
        .unwrap();

    // Wait out the vote-withholding window from the leader contact.
    tokio::time::sleep(RaftOptions::default().leader_failure_timeout() * 2).await;

    let response = fx
        .consensus
        .request_vote(vote_req("c", 2, OpId::new(2, 10)))
        .await
        .unwrap();
    assert!(!response.vote_granted);
    assert_eq!(
        response.error.unwrap().code,
        ConsensusErrorCode::InvalidTerm
    );
    assert_eq!(response.responder_term, 3);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vote_granted_once_per_term() {
    let fx = follower_fixture().await;

    let response = fx
        .consensus
        .request_vote(vote_req("c", 1, OpId::MIN))
        .await
        .unwrap();
    assert!(response.vote_granted);
    assert_eq!(fx.consensus.current_term(), 1);

    // Identical retry: idempotent grant.
    let retry = fx
        .consensus
        .request_vote(vote_req("c", 1, OpId::MIN))
        .await
        .unwrap();
    assert!(retry.vote_granted);

    // A different candidate in the same term is refused.
    let rival = fx
        .consensus
        .request_vote(vote_req("a", 1, OpId::new(5, 100)))
        .await
        .unwrap();
    assert!(!rival.vote_granted);
    assert_eq!(rival.error.unwrap().code, ConsensusErrorCode::AlreadyVoted);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vote_denied_for_stale_log() {
    let fx = follower_fixture().await;
    fx.consensus
        .update(update_req(
            "a",
            1,
            OpId::MIN,
            vec![write_op(1, 1, b"x1"), write_op(1, 2, b"x2")],
            0,
        ))
        .await
        .unwrap();
    tokio::time::sleep(RaftOptions::default().leader_failure_timeout() * 2).await;

    // Candidate's log ends at (1,1): behind ours.
    let response = fx
        .consensus
        .request_vote(vote_req("c", 2, OpId::new(1, 1)))
        .await
        .unwrap();
    assert!(!response.vote_granted);
    assert_eq!(
        response.error.unwrap().code,
        ConsensusErrorCode::LastOpIdTooOld
    );

    // The denial recorded no vote: an up-to-date candidate still wins it.
    let response = fx
        .consensus
        .request_vote(vote_req("a", 2, OpId::new(1, 2)))
        .await
        .unwrap();
    assert!(response.vote_granted, "{:?}", response.error);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vote_withheld_while_leader_alive() {
    let fx = follower_fixture().await;
    fx.consensus
        .update(update_req("a", 1, OpId::MIN, vec![], 0))
        .await
        .unwrap();

    // Immediately after leader contact, votes are withheld.
    let response = fx
        .consensus
        .request_vote(vote_req("c", 2, OpId::new(1, 10)))
        .await
        .unwrap();
    assert!(!response.vote_granted);
    assert_eq!(
        response.error.unwrap().code,
        ConsensusErrorCode::LeaderIsAlive
    );
    // The denial did not adopt the candidate's term.
    assert_eq!(fx.consensus.current_term(), 1);

    // A graceful hand-off bypasses the withholding.
    let mut request = vote_req("c", 2, OpId::new(1, 10));
    request.ignore_live_leader = true;
    let response = fx.consensus.request_vote(request).await.unwrap();
    assert!(response.vote_granted, "{:?}", response.error);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pre_vote_is_not_recorded() {
    let fx = follower_fixture().await;

    let mut pre = vote_req("c", 4, OpId::new(1, 10));
    pre.is_pre_election = true;
    let response = fx.consensus.request_vote(pre).await.unwrap();
    assert!(response.vote_granted);
    // Answering a pre-vote neither adopts the term nor records a vote.
    assert_eq!(fx.consensus.current_term(), 0);

    // The real vote in that term can still go to someone else.
    let response = fx
        .consensus
        .request_vote(vote_req("a", 4, OpId::new(1, 10)))
        .await
        .unwrap();
    assert!(response.vote_granted);
    assert_eq!(fx.consensus.current_term(), 4);
    fx.consensus.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vote_denial_still_advances_term() {
    let fx = follower_fixture().await;
    fx.consensus
        .update(update_req(
            "a",
            1,
            OpId::MIN,
            vec![write_op(1, 1, b"x1")],
            0,
        ))
        .await
        .unwrap();
    tokio::time::sleep(RaftOptions::default().leader_failure_timeout() * 2).await;

    // Denied for a stale log, but the candidacy's higher term sticks.
    let response = fx
        .consensus
        .request_vote(vote_req("c", 7, OpId::MIN))
        .await
        .unwrap();
    assert!(!response.vote_granted);
    assert_eq!(response.responder_term, 7);
    assert_eq!(fx.consensus.current_term(), 7);
    fx.consensus.shutdown().await;
}
