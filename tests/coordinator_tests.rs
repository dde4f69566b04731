mod common;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{
    bkt, coordinator, ready_worker, test_config, DroppingCache, LateLease, Shared, SlowCache, TOPICS,
};
use roster_sync::cache::{MemoryCache, RosterCache};
use roster_sync::catalog::StaticCatalog;
use roster_sync::predictor::{BktParams, BktPredictor, Predictor, PredictorError};
use roster_sync::roster::DEFAULT_MASTERY;
use roster_sync::sync::lease::LeaseProvider;
use roster_sync::sync::RosterSnapshot;
use roster_sync::{Prediction, RosterCoordinator, RosterError};

/// Fails for one topic, delegates to BKT otherwise.
struct BrokenTopic {
    topic: &'static str,
    inner: BktPredictor,
}

impl Predictor for BrokenTopic {
    fn predict(&self, topic: &str, history: &[bool]) -> Result<Prediction, PredictorError> {
        if topic == self.topic {
            return Err(PredictorError::Failed {
                topic: topic.to_string(),
                reason: "model not loaded".to_string(),
            });
        }
        self.inner.predict(topic, history)
    }
}

// ============================================================================
// Roster semantics through the coordinator
// ============================================================================

#[tokio::test]
async fn test_ohms_law_scenario() {
    let shared = Shared::new();
    let worker = RosterCoordinator::new(
        test_config(),
        Arc::new(shared.cache.clone()),
        Arc::new(shared.store.clone()),
        Arc::new(shared.lease.clone()),
        Arc::new(StaticCatalog::new(["ohms-law"])),
        bkt(),
    );

    worker.reset_roster().await.unwrap();
    worker.enroll_students("ohms-law", &["s1"]).await.unwrap();
    let recorded = worker.record_response("ohms-law", "s1", "1").await.unwrap();
    assert!(recorded.is_trained());

    let mastery = worker.get_mastery("ohms-law", "s1").await.unwrap();
    assert!((0.0..=1.0).contains(&mastery));
    assert_eq!(Some(mastery), recorded.probability());
}

#[tokio::test]
async fn test_recorded_prediction_is_what_later_reads_return() {
    let (_shared, worker) = ready_worker().await;
    let patterns = ["1", "0", "10", "011", "1101", "00101", "111000"];

    for (n, pattern) in patterns.iter().cycle().take(60).enumerate() {
        let student = format!("s{n}");
        let recorded = worker.record_response("ohms-law", &student, pattern).await.unwrap();
        let read_back = worker.get_prediction("ohms-law", &student).await.unwrap();
        assert_eq!(read_back, recorded, "{student} after {pattern}");
        assert_eq!(
            worker.get_mastery("ohms-law", &student).await.unwrap(),
            recorded.probability().unwrap()
        );
    }
}

#[tokio::test]
async fn test_unknown_topic_fails_every_operation() {
    let (_shared, worker) = ready_worker().await;
    let is_invalid = |err: RosterError| matches!(err, RosterError::InvalidTopic { .. });

    assert!(is_invalid(worker.enroll_students("optics", &["s1"]).await.unwrap_err()));
    assert!(is_invalid(worker.unenroll_students("optics", &["s1"]).await.unwrap_err()));
    assert!(is_invalid(worker.get_mastery("optics", "s1").await.unwrap_err()));
    assert!(is_invalid(worker.record_response("optics", "s1", "1").await.unwrap_err()));
    let batch = BTreeMap::from([("optics".to_string(), "10".to_string())]);
    assert!(is_invalid(
        worker.record_responses_multi_topic("s1", &batch).await.unwrap_err()
    ));

    assert_eq!(worker.current_snapshot().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_enroll_twice_is_idempotent() {
    let (_shared, worker) = ready_worker().await;
    assert_eq!(worker.enroll_students("kirchhoff", &["s1", "s2"]).await.unwrap(), 2);
    assert_eq!(worker.enroll_students("kirchhoff", &["s2", " s1 "]).await.unwrap(), 0);

    let snapshot = worker.current_snapshot().await.unwrap();
    let students = snapshot.roster.skill_roster("kirchhoff").unwrap().students();
    assert_eq!(students.len(), 2);
}

#[tokio::test]
async fn test_record_response_auto_enrolls() {
    let (_shared, worker) = ready_worker().await;
    worker.record_response("thevenin", "newcomer", "0").await.unwrap();

    let prediction = worker.get_prediction("thevenin", "newcomer").await.unwrap();
    assert!(prediction.is_trained());
}

#[tokio::test]
async fn test_unenroll_then_get_mastery_starts_over() {
    let (_shared, worker) = ready_worker().await;
    worker.record_response("ohms-law", "s1", "1111").await.unwrap();
    assert!(worker.get_mastery("ohms-law", "s1").await.unwrap() > DEFAULT_MASTERY);

    assert_eq!(worker.unenroll_students("ohms-law", &["s1", "ghost"]).await.unwrap(), 1);
    assert_eq!(worker.get_mastery("ohms-law", "s1").await.unwrap(), DEFAULT_MASTERY);

    let snapshot = worker.current_snapshot().await.unwrap();
    assert_eq!(snapshot.roster.history_len("ohms-law", "s1"), 0);
    assert!(snapshot.roster.is_enrolled("ohms-law", "s1"));
}

#[tokio::test]
async fn test_unenroll_everywhere_and_all_masteries() {
    let (_shared, worker) = ready_worker().await;
    let all = worker.get_all_masteries("s1").await.unwrap();
    assert_eq!(all.len(), TOPICS.len());
    assert!(all.values().all(|mastery| *mastery == DEFAULT_MASTERY));

    worker.record_response("kirchhoff", "s2", "01").await.unwrap();
    let table = worker.all_mastery_probabilities().await.unwrap();
    assert_eq!(table["ohms-law"].len(), 1);
    assert_eq!(table["kirchhoff"].len(), 2);

    assert_eq!(worker.unenroll_student_everywhere("s1").await.unwrap(), TOPICS.len());
    let table = worker.all_mastery_probabilities().await.unwrap();
    assert!(table.values().all(|students| !students.contains_key("s1")));
    assert!(table["kirchhoff"].contains_key("s2"));
}

#[tokio::test]
async fn test_multi_topic_records_every_topic_in_one_write() {
    let (_shared, worker) = ready_worker().await;
    let batch = BTreeMap::from([
        ("ohms-law".to_string(), "110".to_string()),
        ("thevenin".to_string(), "1".to_string()),
    ]);
    let predictions = worker.record_responses_multi_topic("s1", &batch).await.unwrap();
    assert_eq!(predictions.len(), 2);
    assert!(predictions.values().all(|prediction| prediction.is_trained()));

    let snapshot = worker.current_snapshot().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.roster.history_len("ohms-law", "s1"), 3);
    assert_eq!(snapshot.roster.history_len("thevenin", "s1"), 1);
}

#[tokio::test]
async fn test_malformed_encoding_is_rejected_before_locking() {
    let (shared, worker) = ready_worker().await;
    for raw in ["", "2", "1 0", "true"] {
        assert!(matches!(
            worker.record_response("ohms-law", "s1", raw).await,
            Err(RosterError::MalformedResponseEncoding { .. })
        ));
    }
    assert!(!shared.lease.is_held());
    assert_eq!(worker.current_snapshot().await.unwrap().version, 1);
}

#[tokio::test]
async fn test_blank_student_ids_are_rejected_by_every_operation() {
    let (shared, worker) = ready_worker().await;
    let blank = |err: RosterError| matches!(err, RosterError::BlankStudentId) && err.is_operational();

    assert!(blank(worker.get_mastery("ohms-law", "  ").await.unwrap_err()));
    assert!(blank(worker.get_all_masteries("").await.unwrap_err()));
    assert!(blank(worker.record_response("ohms-law", " ", "1").await.unwrap_err()));
    assert!(blank(worker.unenroll_student_everywhere("\t").await.unwrap_err()));
    assert!(blank(
        worker
            .record_responses_multi_topic(" ", &BTreeMap::new())
            .await
            .unwrap_err()
    ));

    // enrollment lists skip blanks instead of failing the batch
    assert_eq!(worker.enroll_students("ohms-law", &["  ", "s1"]).await.unwrap(), 1);

    let snapshot = worker.current_snapshot().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert!(snapshot
        .roster
        .skill_rosters()
        .values()
        .all(|skill| skill.students().iter().all(|id| !id.trim().is_empty())));
    assert!(!shared.lease.is_held());
}

#[tokio::test]
async fn test_reset_matches_catalog_and_keeps_version_moving() {
    let (_shared, worker) = ready_worker().await;
    worker.enroll_students("ohms-law", &["s1", "s2"]).await.unwrap();
    worker.record_response("kirchhoff", "s3", "1").await.unwrap();

    let reset = worker.reset_roster().await.unwrap();
    assert_eq!(reset.version, 4);
    let keys: Vec<&str> = reset.roster.skill_rosters().keys().map(String::as_str).collect();
    let mut expected = TOPICS.to_vec();
    expected.sort_unstable();
    assert_eq!(keys, expected);
    assert!(reset.roster.skill_rosters().values().all(|skill| skill.is_empty()));
}

// ============================================================================
// Concurrency and failure handling
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_records_from_two_workers_are_not_lost() {
    let (shared, _) = ready_worker().await;
    let first = Arc::new(shared.worker());
    let second = Arc::new(shared.worker());
    const ROUNDS: usize = 20;

    let spawn = |worker: Arc<RosterCoordinator>, bit: &'static str| {
        tokio::spawn(async move {
            for _ in 0..ROUNDS {
                worker.record_response("ohms-law", "s1", bit).await.unwrap();
            }
        })
    };
    let a = spawn(Arc::clone(&first), "1");
    let b = spawn(Arc::clone(&second), "0");
    a.await.unwrap();
    b.await.unwrap();

    let snapshot = first.current_snapshot().await.unwrap();
    assert_eq!(snapshot.roster.history_len("ohms-law", "s1"), 2 * ROUNDS);
    assert_eq!(snapshot.version, 1 + 2 * ROUNDS as u64);

    let history = snapshot
        .roster
        .skill_roster("ohms-law")
        .unwrap()
        .history("s1")
        .unwrap();
    assert_eq!(history.iter().filter(|bit| **bit).count(), ROUNDS);
}

#[tokio::test]
async fn test_dropped_cache_writes_time_out_convergence() {
    let (shared, _) = ready_worker().await;
    let worker = coordinator(
        test_config(),
        Arc::new(DroppingCache::new(shared.cache.clone(), 0)),
        Arc::new(shared.store.clone()),
        Arc::new(shared.lease.clone()),
        bkt(),
    );

    let err = worker.enroll_students("ohms-law", &["s1"]).await.unwrap_err();
    assert!(matches!(
        err,
        RosterError::ConvergenceTimeout { operation: "enroll_students", attempts: 3 }
    ));
    assert!(!err.is_retryable());
    assert!(!shared.lease.is_held());

    let snapshot = shared.worker().current_snapshot().await.unwrap();
    assert_eq!(snapshot.version, 1);
    assert!(!snapshot.roster.is_enrolled("ohms-law", "s1"));
}

#[tokio::test]
async fn test_held_lease_exceeds_deadline() {
    let (shared, _) = ready_worker().await;
    let mut config = test_config();
    config.operation_timeout = Duration::from_millis(50);
    let impatient = shared.worker_with(config, bkt());

    let held = shared
        .lease
        .acquire(tokio::time::Instant::now() + Duration::from_secs(1))
        .await
        .unwrap();
    let err = impatient.enroll_students("ohms-law", &["s1"]).await.unwrap_err();
    assert!(matches!(err, RosterError::DeadlineExceeded { operation: "enroll_students", .. }));
    assert!(err.is_retryable());

    shared.lease.release(held).await.unwrap();
    assert_eq!(impatient.enroll_students("ohms-law", &["s1"]).await.unwrap(), 1);
}

#[tokio::test]
async fn test_lease_won_after_deadline_is_still_released() {
    let (shared, _) = ready_worker().await;
    let mut config = test_config();
    config.operation_timeout = Duration::from_millis(50);
    let lease = Arc::new(LateLease::default());
    let worker = coordinator(
        config,
        Arc::new(shared.cache.clone()),
        Arc::new(shared.store.clone()),
        lease.clone(),
        bkt(),
    );

    assert!(matches!(
        worker.enroll_students("ohms-law", &["s1"]).await,
        Err(RosterError::DeadlineExceeded { operation: "enroll_students", .. })
    ));
    assert_eq!(lease.granted.load(Ordering::SeqCst), 1);
    assert_eq!(lease.released.load(Ordering::SeqCst), 1);

    let snapshot = shared.worker().current_snapshot().await.unwrap();
    assert_eq!(snapshot.version, 1);
}

#[tokio::test]
async fn test_slow_cache_exceeds_deadline_and_frees_lease() {
    let (shared, _) = ready_worker().await;
    let mut config = test_config();
    config.operation_timeout = Duration::from_millis(50);
    let worker = coordinator(
        config,
        Arc::new(SlowCache {
            inner: shared.cache.clone(),
            delay: Duration::from_millis(500),
        }),
        Arc::new(shared.store.clone()),
        Arc::new(shared.lease.clone()),
        bkt(),
    );

    assert!(matches!(
        worker.get_mastery("ohms-law", "s1").await,
        Err(RosterError::DeadlineExceeded { .. })
    ));
    assert!(!shared.lease.is_held());
}

#[tokio::test]
async fn test_predictor_failure_leaves_cache_untouched() {
    let (shared, healthy) = ready_worker().await;
    healthy.record_response("ohms-law", "s1", "1").await.unwrap();

    let broken = shared.worker_with(
        test_config(),
        Arc::new(BrokenTopic {
            topic: "kirchhoff",
            inner: BktPredictor::with_default(BktParams::default()),
        }),
    );
    let batch = BTreeMap::from([
        ("ohms-law".to_string(), "0".to_string()),
        ("kirchhoff".to_string(), "1".to_string()),
    ]);
    let err = broken
        .record_responses_multi_topic("s1", &batch)
        .await
        .unwrap_err();
    assert!(matches!(err, RosterError::Predictor(_)));
    assert!(!err.is_operational());

    let snapshot = healthy.current_snapshot().await.unwrap();
    assert_eq!(snapshot.version, 2);
    assert_eq!(snapshot.roster.history_len("ohms-law", "s1"), 1);
    assert!(!snapshot.roster.is_enrolled("kirchhoff", "s1"));

    // the same worker keeps serving topics its model can handle
    broken.record_response("ohms-law", "s1", "0").await.unwrap();
}

#[tokio::test]
async fn test_uninitialized_cache_is_reported() {
    let shared = Shared::new();
    let worker = shared.worker();
    assert!(matches!(
        worker.get_all_masteries("s1").await,
        Err(RosterError::RosterUninitialized)
    ));
    assert!(matches!(
        worker.shutdown().await,
        Err(RosterError::RosterUninitialized)
    ));
}

#[tokio::test]
async fn test_corrupt_cache_is_not_overwritten_by_mutations() {
    let (shared, worker) = ready_worker().await;
    let key = worker.config().cache_key.clone();
    shared.cache.set(&key, b"{\"version\":9,\"roster\":[]}").await.unwrap();

    assert!(matches!(
        worker.enroll_students("ohms-law", &["s1"]).await,
        Err(RosterError::CorruptSnapshot(_))
    ));
    assert_eq!(
        RosterSnapshot::peek_version(&shared.cache.get(&key).await.unwrap().unwrap()),
        Some(9)
    );

    // a reset recovers and continues the counter
    assert_eq!(worker.reset_roster().await.unwrap().version, 10);
}

#[tokio::test]
async fn test_fresh_cache_per_worker_is_independent() {
    let first = Shared::new().worker();
    let second = coordinator(
        test_config(),
        Arc::new(MemoryCache::new()),
        Arc::new(roster_sync::store::MemoryStore::new()),
        Arc::new(roster_sync::sync::lease::LocalLease::new()),
        bkt(),
    );
    first.bootstrap().await.unwrap();
    second.bootstrap().await.unwrap();
    first.enroll_students("ohms-law", &["s1"]).await.unwrap();

    let other = second.current_snapshot().await.unwrap();
    assert!(!other.roster.is_enrolled("ohms-law", "s1"));
}
