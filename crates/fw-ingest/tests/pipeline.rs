//! End-to-end ingest tests against a real SQLite store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, TimeZone, Utc};
use fw_core::{
    ActivityKind, ActivityLogEntry, CostAssignment, DetectionMethod, FuelFillEvent,
    OperatingSession, Plate, Policy, ReorderPolicy, SessionId, SessionPatch, SessionStatus,
    SessionStore, StaticDirectory, StoreError,
};
use fw_db::{Database, SessionFilter, SqliteStore};
use fw_ingest::{Gateway, IngestConfig, RetryPolicy, feed_lines};
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 6, 0, 0).unwrap()
}

fn plate() -> Plate {
    Plate::new("GEN-01").unwrap()
}

fn line(secs: i64, status: &str, fuel: Option<f64>) -> String {
    line_for("gen-01", secs, status, fuel)
}

fn line_for(plate: &str, secs: i64, status: &str, fuel: Option<f64>) -> String {
    let mut value = json!({
        "plate": plate,
        "device_time": (t0() + Duration::seconds(secs)).to_rfc3339(),
        "status_token": status,
    });
    if let Some(fuel) = fuel {
        value["fuel_volume_liters"] = json!(fuel);
    }
    value.to_string()
}

fn scenario_a() -> Vec<String> {
    vec![
        line(0, "ENGINE ON", None),
        line(5, "", Some(500.0)),
        line(60, "", Some(480.0)),
        line(240, "ENGINE OFF", None),
        line(245, "", Some(460.0)),
    ]
}

fn scenario_b() -> Vec<String> {
    vec![
        line(0, "ENGINE ON", Some(400.0)),
        line(60, "", Some(390.0)),
        line(115, "", Some(380.0)),
        line(120, "", Some(480.0)),
        line(180, "", Some(480.0)),
        line(240, "ENGINE OFF", Some(460.0)),
    ]
}

fn directory() -> Arc<StaticDirectory> {
    Arc::new(StaticDirectory::new([(
        "GEN-01".to_string(),
        CostAssignment {
            cost_code: "CC-1".into(),
            company: "Acme".into(),
            unmapped: false,
        },
    )]))
}

fn sqlite() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::new(Database::open_in_memory().unwrap()))
}

fn gateway(store: Arc<dyn SessionStore>, config: IngestConfig) -> Gateway {
    Gateway::new(store, Arc::new(Policy::default()), directory(), config)
}

async fn run_lines(store: Arc<dyn SessionStore>, lines: &[String]) -> fw_ingest::IngestStatsSnapshot {
    let mut gateway = gateway(store, IngestConfig::default());
    for line in lines {
        gateway.dispatch_raw(line).await;
    }
    gateway.shutdown().await
}

fn sessions(store: &SqliteStore) -> Vec<OperatingSession> {
    store
        .with_db(|db| db.list_sessions(&SessionFilter::default()))
        .unwrap()
}

fn fills(store: &SqliteStore) -> Vec<FuelFillEvent> {
    store.with_db(|db| db.list_fills(None, None)).unwrap()
}

fn activity(store: &SqliteStore) -> Vec<ActivityLogEntry> {
    store.with_db(|db| db.list_activity(None, 1000)).unwrap()
}

#[tokio::test]
async fn reordered_arrival_reconstructs_session() {
    let store = sqlite();
    let arrival = scenario_a();
    let shuffled = [3, 1, 4, 0, 2].map(|i| arrival[i].clone());

    let stats = run_lines(store.clone(), &shuffled).await;
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.late, 0);

    let rows = sessions(&store);
    assert_eq!(rows.len(), 1);
    let session = &rows[0];
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.start_time, t0());
    assert_eq!(session.end_time, Some(t0() + Duration::seconds(240)));
    assert!((session.opening_fuel - 500.0).abs() < 1e-9);
    assert_eq!(session.closing_fuel, Some(460.0));
    assert!((session.fuel_used_liters - 40.0).abs() < 1e-3);
    assert!((session.operating_hours - 240.0 / 3600.0).abs() < 1e-6);
    assert_eq!(session.cost_code, "CC-1");
    session.check_invariants().unwrap();
}

#[tokio::test]
async fn mid_session_fill_is_recorded_and_added_back() {
    let store = sqlite();
    run_lines(store.clone(), &scenario_b()).await;

    let rows = sessions(&store);
    assert_eq!(rows.len(), 1);
    assert!((rows[0].fuel_used_liters - 40.0).abs() < 1e-3);
    assert!((rows[0].fuel_filled_liters - 100.0).abs() < 1e-3);

    let recorded = fills(&store);
    assert_eq!(recorded.len(), 1);
    assert!((recorded[0].fill_amount - 100.0).abs() < 1e-3);
    assert!((recorded[0].fuel_before - 380.0).abs() < 1e-9);
    assert_eq!(
        recorded[0].detection_method,
        DetectionMethod::PassiveLevelIncrease
    );
}

#[tokio::test]
async fn replaying_the_same_feed_is_idempotent() {
    let store = sqlite();
    run_lines(store.clone(), &scenario_b()).await;
    let first_sessions = sessions(&store);
    let first_fills = fills(&store);

    run_lines(store.clone(), &scenario_b()).await;
    assert_eq!(sessions(&store), first_sessions);
    assert_eq!(fills(&store), first_fills);
}

#[tokio::test]
async fn arrival_order_within_window_does_not_matter() {
    let baseline = sqlite();
    run_lines(baseline.clone(), &scenario_b()).await;
    let expected_sessions = sessions(&baseline);
    let expected_fills = fills(&baseline);

    let lines = scenario_b();
    let orders: [[usize; 6]; 3] = [[5, 4, 3, 2, 1, 0], [2, 0, 5, 1, 4, 3], [1, 3, 5, 0, 2, 4]];
    for order in orders {
        let store = sqlite();
        let permuted: Vec<String> = order.iter().map(|&i| lines[i].clone()).collect();
        run_lines(store.clone(), &permuted).await;
        assert_eq!(sessions(&store), expected_sessions, "order {order:?}");
        assert_eq!(fills(&store), expected_fills, "order {order:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn straggler_after_partial_release_is_kept() {
    let store = sqlite();
    let mut gateway = gateway(store.clone(), IngestConfig::default());

    gateway.dispatch_raw(&line(0, "ENGINE ON", None)).await;
    tokio::time::sleep(StdDuration::from_secs(15)).await;
    gateway.dispatch_raw(&line(60, "", Some(480.0))).await;
    // The first window ends at 20s and releases only the ENGINE ON.
    tokio::time::sleep(StdDuration::from_secs(6)).await;
    gateway.dispatch_raw(&line(5, "", Some(500.0))).await;
    gateway.dispatch_raw(&line(240, "ENGINE OFF", None)).await;
    gateway.dispatch_raw(&line(245, "", Some(460.0))).await;
    let stats = gateway.shutdown().await;

    assert_eq!(stats.late, 0);
    assert_eq!(stats.processed, 5);
    let rows = sessions(&store);
    assert_eq!(rows.len(), 1);
    assert!((rows[0].opening_fuel - 500.0).abs() < 1e-9);
    assert_eq!(rows[0].closing_fuel, Some(460.0));
    assert!((rows[0].fuel_used_liters - 40.0).abs() < 1e-3);
}

#[tokio::test]
async fn malformed_messages_are_counted_not_fatal() {
    let store = sqlite();
    let lines = vec![
        "not json".to_string(),
        json!({"plate": "GEN-01"}).to_string(),
        json!({"device_time": "2025-03-01T06:00:00Z"}).to_string(),
        json!({
            "plate": "GEN-01",
            "device_time": "2025-03-01T06:00:00Z",
            "fuel_volume_liters": "lots",
        })
        .to_string(),
        line(0, "ENGINE ON", Some(300.0)),
    ];
    let stats = run_lines(store.clone(), &lines).await;

    assert_eq!(stats.received, 5);
    assert_eq!(stats.malformed, 4);
    assert_eq!(stats.processed, 1);
    let rows = sessions(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SessionStatus::Ongoing);
}

#[tokio::test]
async fn restart_resumes_ongoing_session() {
    let store = sqlite();
    run_lines(
        store.clone(),
        &[line(0, "ENGINE ON", Some(300.0)), line(600, "", Some(295.0))],
    )
    .await;
    assert_eq!(sessions(&store)[0].status, SessionStatus::Ongoing);

    let stats = run_lines(store.clone(), &[line(3600, "ENGINE OFF", Some(250.0))]).await;
    assert_eq!(stats.resumed, 1);

    let rows = sessions(&store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SessionStatus::Completed);
    assert!((rows[0].fuel_used_liters - 50.0).abs() < 1e-3);
    assert!((rows[0].operating_hours - 1.0).abs() < 1e-6);
}

#[tokio::test]
async fn feed_lines_skips_blank_lines() {
    let store = sqlite();
    let mut input = scenario_a().join("\n\n");
    input.push('\n');
    let mut gateway = gateway(store.clone(), IngestConfig::default());

    let summary = feed_lines(input.as_bytes(), &mut gateway).await.unwrap();
    gateway.shutdown().await;

    assert_eq!(summary.lines, 5);
    assert_eq!(summary.malformed, 0);
    assert_eq!(sessions(&store).len(), 1);
}

/// Fails the first `failures` calls of every kind with a transient error.
struct Flaky {
    inner: Arc<SqliteStore>,
    failures: AtomicU32,
}

impl Flaky {
    fn check(&self) -> Result<(), StoreError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(StoreError::Unavailable("database is locked".into()))
        } else {
            Ok(())
        }
    }
}

impl SessionStore for Flaky {
    fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError> {
        self.check()?;
        self.inner.create_session(session)
    }

    fn update_session(
        &self,
        id: &SessionId,
        expected_status: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.inner.update_session(id, expected_status, patch)
    }

    fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), StoreError> {
        self.check()?;
        self.inner.upsert_fill_event(fill)
    }

    fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.check()?;
        self.inner.append_activity(entry)
    }

    fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, StoreError> {
        self.check()?;
        self.inner.ongoing_session(plate)
    }
}

fn fast_retry() -> IngestConfig {
    IngestConfig {
        retry: RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 3,
            cooldown_ms: 10,
            ..RetryPolicy::default()
        },
        ..IngestConfig::default()
    }
}

#[tokio::test]
async fn outage_delays_writes_without_losing_them() {
    let inner = sqlite();
    let flaky = Arc::new(Flaky {
        inner: inner.clone(),
        failures: AtomicU32::new(8),
    });
    let mut gateway = gateway(flaky, fast_retry());
    let mut failures = gateway.take_failures().unwrap();
    for line in scenario_b() {
        gateway.dispatch_raw(&line).await;
    }
    let stats = gateway.shutdown().await;

    assert!(stats.write_retries > 0);
    assert_eq!(stats.writes_dropped, 0);
    let failure = failures.try_recv().unwrap();
    assert!(failure.queued);

    let rows = sessions(&inner);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, SessionStatus::Completed);
    assert!((rows[0].fuel_used_liters - 40.0).abs() < 1e-3);
    assert_eq!(fills(&inner).len(), 1);
}

/// Hides ONGOING sessions from the first lookup, as if another process
/// opened one right after this worker started.
struct LateOngoing {
    inner: Arc<SqliteStore>,
    hidden: AtomicBool,
}

impl SessionStore for LateOngoing {
    fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError> {
        self.inner.create_session(session)
    }

    fn update_session(
        &self,
        id: &SessionId,
        expected_status: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        self.inner.update_session(id, expected_status, patch)
    }

    fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), StoreError> {
        self.inner.upsert_fill_event(fill)
    }

    fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.inner.append_activity(entry)
    }

    fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, StoreError> {
        if self.hidden.swap(false, Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.ongoing_session(plate)
    }
}

#[tokio::test]
async fn conflicting_ongoing_session_is_adopted() {
    let inner = sqlite();
    let earlier_start = t0() - Duration::hours(1);
    let existing = OperatingSession::open(
        SessionId::derive(&plate(), earlier_start),
        plate(),
        earlier_start,
        600.0,
        CostAssignment {
            cost_code: "CC-1".into(),
            company: "Acme".into(),
            unmapped: false,
        },
    );
    inner.create_session(&existing).unwrap();

    let store = Arc::new(LateOngoing {
        inner: inner.clone(),
        hidden: AtomicBool::new(true),
    });
    let stats = run_lines(
        store,
        &[
            line(0, "ENGINE ON", Some(500.0)),
            line(240, "ENGINE OFF", Some(460.0)),
        ],
    )
    .await;
    assert_eq!(stats.adoptions, 1);

    let rows = sessions(&inner);
    assert_eq!(rows.len(), 1);
    let session = &rows[0];
    assert_eq!(session.id, existing.id);
    assert_eq!(session.status, SessionStatus::Completed);
    assert!((session.fuel_used_liters - 140.0).abs() < 1e-3);
    assert!((session.operating_hours - (3600.0 + 240.0) / 3600.0).abs() < 1e-6);
    session.check_invariants().unwrap();

    assert!(
        activity(&inner)
            .iter()
            .any(|entry| entry.kind == ActivityKind::SessionAdopted)
    );
}

/// Stalls and then fails every call for one plate, as if its rows sat
/// behind a long-held lock.
struct SlowPlate {
    inner: Arc<SqliteStore>,
    slow: Plate,
    delay: StdDuration,
}

impl SlowPlate {
    fn check(&self, plate: &Plate) -> Result<(), StoreError> {
        if plate == &self.slow {
            std::thread::sleep(self.delay);
            return Err(StoreError::Unavailable("row locked".into()));
        }
        Ok(())
    }
}

impl SessionStore for SlowPlate {
    fn create_session(&self, session: &OperatingSession) -> Result<SessionId, StoreError> {
        self.check(&session.plate)?;
        self.inner.create_session(session)
    }

    fn update_session(
        &self,
        id: &SessionId,
        expected_status: SessionStatus,
        patch: &SessionPatch,
    ) -> Result<(), StoreError> {
        self.inner.update_session(id, expected_status, patch)
    }

    fn upsert_fill_event(&self, fill: &FuelFillEvent) -> Result<(), StoreError> {
        self.check(&fill.plate)?;
        self.inner.upsert_fill_event(fill)
    }

    fn append_activity(&self, entry: &ActivityLogEntry) -> Result<(), StoreError> {
        self.check(&entry.plate)?;
        self.inner.append_activity(entry)
    }

    fn ongoing_session(&self, plate: &Plate) -> Result<Option<OperatingSession>, StoreError> {
        self.check(plate)?;
        self.inner.ongoing_session(plate)
    }
}

#[tokio::test]
async fn slow_plate_does_not_hold_up_other_plates() {
    let inner = sqlite();
    let store = Arc::new(SlowPlate {
        inner: inner.clone(),
        slow: Plate::new("SLOW").unwrap(),
        delay: StdDuration::from_millis(400),
    });
    let policy = Policy {
        reorder: ReorderPolicy {
            window_ms: 0,
            ..ReorderPolicy::default()
        },
        ..Policy::default()
    };
    let config = IngestConfig {
        channel_capacity: 1,
        shutdown_timeout_ms: 500,
        retry: RetryPolicy {
            initial_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: 2,
            cooldown_ms: 10_000,
            ..RetryPolicy::default()
        },
        ..IngestConfig::default()
    };
    let mut gateway = Gateway::new(store, Arc::new(policy), directory(), config);

    let started = std::time::Instant::now();
    for secs in 0..4 {
        gateway
            .dispatch_raw(&line_for("slow", secs * 60, "ENGINE ON", Some(300.0)))
            .await;
    }
    gateway.dispatch_raw(&line(0, "ENGINE ON", Some(200.0))).await;
    let elapsed = started.elapsed();
    assert!(elapsed < StdDuration::from_millis(300), "dispatch took {elapsed:?}");

    let stats = gateway.shutdown().await;
    assert_eq!(stats.processed, 5);
    assert!(stats.writes_dropped > 0);

    let rows = sessions(&inner);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].plate, plate());
    assert_eq!(rows[0].status, SessionStatus::Ongoing);
}
