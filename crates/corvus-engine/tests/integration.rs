//! End-to-end pipeline scenarios: windowed thresholds, dedup folding,
//! failure retry semantics, and the consumer loop.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;

use corvus_engine::{
    AlertQuery, AlertRecord, AlertRepository, AlertStatus, Consumer, EngineError,
    JsonLinesSource, MemoryAlertRepository, MemoryWindowStore, NormalizedEvent, Pipeline,
    RetryConfig, RuleSet, ShutdownFlag, WindowSnapshot, WindowStore,
};
use corvus_rule::parse_rule_str;

const BRUTE_FORCE_RULE: &str = r#"
id: test-bruteforce-01
name: SSH brute force
description: Five failed logins from one source within five minutes
severity: high
triggers:
  - type: event
    event_type: login_failure
aggregation:
  function: count
  field: username
  group_by: source_ip
  window_seconds: 300
  operator: gte
  threshold: 5
"#;

fn login_failure(ip: &str, username: &str, secs: i64) -> NormalizedEvent {
    let mut ev = NormalizedEvent::new("login_failure");
    ev.timestamp = Utc.timestamp_opt(secs, 0).unwrap();
    ev.source_ip = Some(ip.to_string());
    ev.metadata.insert("username".to_string(), json!(username));
    ev
}

fn pipeline(repo: Arc<dyn AlertRepository>) -> Pipeline {
    let rule = parse_rule_str(BRUTE_FORCE_RULE).unwrap();
    Pipeline::new(
        RuleSet::compile(vec![rule]).unwrap(),
        Arc::new(MemoryWindowStore::default()),
        repo,
        "corvus:",
    )
}

#[test]
fn brute_force_scenario() {
    let repo = Arc::new(MemoryAlertRepository::new());
    let p = pipeline(repo.clone());

    let base = 1_700_000_000i64;
    let mut created: Option<AlertRecord> = None;

    // Seven synthetic events, ten seconds apart, same source and username.
    for i in 0..7 {
        let event = login_failure("192.168.1.100", "testuser", base + i * 10);
        let alerts = p.process_event(&event).unwrap();

        match i {
            0..=3 => assert!(alerts.is_empty(), "no alert expected after event {}", i + 1),
            4 => {
                assert_eq!(alerts.len(), 1, "event 5 crosses the threshold");
                let alert = &alerts[0];
                assert_eq!(alert.rule_id, "test-bruteforce-01");
                assert_eq!(alert.status, AlertStatus::New);
                assert_eq!(alert.alert_count, 1);
                assert_eq!(alert.aggregation_count, Some(5));
                assert_eq!(alert.aggregated_value, Some(5.0));
                created = Some(alert.clone());
            }
            _ => {
                assert_eq!(alerts.len(), 1, "events 6-7 fold into the same alert");
                let alert = &alerts[0];
                let first = created.as_ref().unwrap();
                assert_eq!(alert.id, first.id, "no new row");
                assert_eq!(alert.alert_count, (i - 3) as u64);
                assert_eq!(alert.first_seen, first.first_seen);
                assert!(alert.last_seen > first.last_seen);
            }
        }
    }

    // Exactly one persisted alert for the whole burst.
    let all = repo.list(&AlertQuery::default()).unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].alert_count, 3);
}

#[test]
fn group_isolation_across_sources() {
    let repo = Arc::new(MemoryAlertRepository::new());
    let p = pipeline(repo.clone());

    let base = 1_700_000_000i64;
    // A reaches 5; B only 2 — crossing A's threshold must not affect B.
    for i in 0..5 {
        p.process_event(&login_failure("10.0.0.1", "u", base + i)).unwrap();
    }
    for i in 0..2 {
        p.process_event(&login_failure("10.0.0.2", "u", base + i)).unwrap();
    }

    let all = repo.list(&AlertQuery::default()).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].dedup_key.contains("source_ip=10.0.0.1"));
}

#[test]
fn terminal_alert_stops_dedup_folding() {
    let repo = Arc::new(MemoryAlertRepository::new());
    let p = pipeline(repo.clone());

    let base = 1_700_000_000i64;
    for i in 0..5 {
        p.process_event(&login_failure("10.0.0.1", "u", base + i)).unwrap();
    }
    let created = repo.list(&AlertQuery::default()).unwrap();
    let first = &created[0];
    repo.update_status(&first.id, AlertStatus::Resolved, "analyst", None, Utc::now())
        .unwrap();

    // Another qualifying event opens a fresh alert rather than reviving the
    // resolved one.
    let alerts = p
        .process_event(&login_failure("10.0.0.1", "u", base + 10))
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_ne!(alerts[0].id, first.id);
    assert_eq!(alerts[0].alert_count, 1);
    assert_eq!(repo.list(&AlertQuery::default()).unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Transient store failures
// ---------------------------------------------------------------------------

/// Window store that fails its first N calls, then delegates.
struct FlakyStore {
    inner: MemoryWindowStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    fn failing(n: u32) -> Self {
        FlakyStore {
            inner: MemoryWindowStore::default(),
            failures_left: AtomicU32::new(n),
        }
    }
}

impl WindowStore for FlakyStore {
    fn record(
        &self,
        key: &str,
        timestamp: i64,
        weight: f64,
        window_seconds: u64,
    ) -> Result<WindowSnapshot, EngineError> {
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining.saturating_sub(1), Ordering::SeqCst);
            return Err(EngineError::Store("connection reset".to_string()));
        }
        self.inner.record(key, timestamp, weight, window_seconds)
    }

    fn purge_expired(&self, now: i64) -> Result<usize, EngineError> {
        self.inner.purge_expired(now)
    }
}

fn retrying_pipeline(store: Arc<dyn WindowStore>, attempts: u32) -> Pipeline {
    let rule = parse_rule_str(BRUTE_FORCE_RULE).unwrap();
    Pipeline::new(
        RuleSet::compile(vec![rule]).unwrap(),
        store,
        Arc::new(MemoryAlertRepository::new()),
        "corvus:",
    )
    .with_retry(RetryConfig {
        attempts,
        base_delay: Duration::ZERO,
        exponential: false,
    })
}

#[test]
fn transient_store_failure_is_retried() {
    // Two failures, three attempts: the event still registers.
    let p = retrying_pipeline(Arc::new(FlakyStore::failing(2)), 3);
    let result = p.process_event(&login_failure("10.0.0.1", "u", 1_700_000_000));
    assert!(result.is_ok(), "expected recovery, got {result:?}");
}

#[test]
fn exhausted_retries_surface_a_retryable_error() {
    let p = retrying_pipeline(Arc::new(FlakyStore::failing(u32::MAX)), 3);
    let err = p
        .process_event(&login_failure("10.0.0.1", "u", 1_700_000_000))
        .unwrap_err();
    assert!(err.is_retryable(), "caller must be able to force redelivery");
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

#[test]
fn consumer_processes_a_stream_end_to_end() {
    let repo = Arc::new(MemoryAlertRepository::new());
    let p = Arc::new(pipeline(repo.clone()));

    let base = 1_700_000_000i64;
    let mut lines = String::new();
    for i in 0..6 {
        let ev = login_failure("192.168.1.100", "testuser", base + i * 10);
        lines.push_str(&serde_json::to_string(&ev).unwrap());
        lines.push('\n');
    }
    lines.push_str("this is not json\n");

    let source = JsonLinesSource::new(Cursor::new(lines.into_bytes()));
    let mut consumer = Consumer::new(Box::new(source), p);

    let stats = consumer.run(&ShutdownFlag::new()).unwrap();
    assert_eq!(stats.processed, 6);
    assert_eq!(stats.malformed, 1);
    // Event 5 creates the alert; event 6 folds into it.
    assert_eq!(stats.alerts, 2);

    let persisted = repo.list(&AlertQuery::default()).unwrap();
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].alert_count, 2);
}

#[test]
fn consumer_stops_without_committing_on_persistent_failure() {
    let p = Arc::new(retrying_pipeline(Arc::new(FlakyStore::failing(u32::MAX)), 2));

    let ev = login_failure("10.0.0.1", "u", 1_700_000_000);
    let line = format!("{}\n", serde_json::to_string(&ev).unwrap());
    let source = JsonLinesSource::new(Cursor::new(line.into_bytes()));
    let mut consumer = Consumer::new(Box::new(source), p);

    let err = consumer.run(&ShutdownFlag::new()).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn shutdown_finishes_nothing_new_after_flag() {
    let repo = Arc::new(MemoryAlertRepository::new());
    let p = Arc::new(pipeline(repo));

    let ev = login_failure("10.0.0.1", "u", 1_700_000_000);
    let line = format!("{}\n", serde_json::to_string(&ev).unwrap());
    let source = JsonLinesSource::new(Cursor::new(line.into_bytes()));
    let mut consumer = Consumer::new(Box::new(source), p);

    let shutdown = ShutdownFlag::new();
    shutdown.trigger();
    let stats = consumer.run(&shutdown).unwrap();
    assert_eq!(stats.processed, 0, "flag set before the loop starts");
}
