//! Alert persistence.
//!
//! The repository trait is the narrow interface the rest of the engine sees;
//! alerts are created once, then mutated only through `update_status` and
//! `increment_dedup`. Deletion is not offered — retention is someone else's
//! job.
//!
//! Two implementations: an in-memory map for tests and the `eval` CLI path,
//! and SQLite for the long-running consumer. The SQLite layout keeps the
//! full record as a JSON document alongside indexed columns for the fields
//! queries filter on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use corvus_rule::Severity;

use crate::alert::{AlertRecord, AlertStatus};
use crate::error::{EngineError, Result};

// =============================================================================
// Trait
// =============================================================================

/// Filters for the paginated alert listing.
#[derive(Debug, Clone, Default)]
pub struct AlertQuery {
    pub severity: Option<Severity>,
    pub rule_id: Option<String>,
    /// Inclusive lower bound on `triggered_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `triggered_at`.
    pub to: Option<DateTime<Utc>>,
    pub offset: usize,
    pub limit: usize,
}

impl AlertQuery {
    fn effective_limit(&self) -> usize {
        if self.limit == 0 { 50 } else { self.limit }
    }
}

/// Storage interface for alerts.
pub trait AlertRepository: Send + Sync {
    fn create(&self, alert: &AlertRecord) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<AlertRecord>>;

    fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<AlertRecord>>;

    /// Newest-first listing with optional severity/rule/time-range filters.
    fn list(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>>;

    /// Record a status transition. No-ops (returning the unchanged record)
    /// when the status is already current. Fails with
    /// [`EngineError::AlertNotFound`] for an unknown id.
    fn update_status(
        &self,
        id: &str,
        status: AlertStatus,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AlertRecord>;

    /// Fold a repeated firing into an alert: bump `alert_count` and advance
    /// `last_seen`, without touching the status history.
    fn increment_dedup(&self, id: &str, seen_at: DateTime<Utc>) -> Result<AlertRecord>;

    /// Alerts still `New` whose `last_seen` is older than the cutoff — input
    /// for an external escalation/cleanup job.
    fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<AlertRecord>>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Map-backed repository for tests and one-shot evaluation.
#[derive(Default)]
pub struct MemoryAlertRepository {
    inner: Mutex<HashMap<String, AlertRecord>>,
}

impl MemoryAlertRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, AlertRecord>>> {
        self.inner
            .lock()
            .map_err(|_| EngineError::Persistence("alert repository lock poisoned".to_string()))
    }
}

impl AlertRepository for MemoryAlertRepository {
    fn create(&self, alert: &AlertRecord) -> Result<()> {
        let mut inner = self.lock()?;
        if inner.contains_key(&alert.id) {
            return Err(EngineError::Persistence(format!(
                "duplicate alert id '{}'",
                alert.id
            )));
        }
        inner.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<AlertRecord>> {
        Ok(self.lock()?.get(id).cloned())
    }

    fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<AlertRecord>> {
        Ok(self
            .lock()?
            .values()
            .filter(|a| a.dedup_key == dedup_key)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    fn list(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>> {
        let inner = self.lock()?;
        let mut matches: Vec<AlertRecord> = inner
            .values()
            .filter(|a| query.severity.is_none_or(|s| a.severity == s))
            .filter(|a| query.rule_id.as_deref().is_none_or(|r| a.rule_id == r))
            .filter(|a| query.from.is_none_or(|t| a.triggered_at >= t))
            .filter(|a| query.to.is_none_or(|t| a.triggered_at < t))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.triggered_at.cmp(&a.triggered_at));
        Ok(matches
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    fn update_status(
        &self,
        id: &str,
        status: AlertStatus,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AlertRecord> {
        let mut inner = self.lock()?;
        let alert = inner
            .get_mut(id)
            .ok_or_else(|| EngineError::AlertNotFound(id.to_string()))?;
        alert.apply_status(status, actor, comment, now);
        Ok(alert.clone())
    }

    fn increment_dedup(&self, id: &str, seen_at: DateTime<Utc>) -> Result<AlertRecord> {
        let mut inner = self.lock()?;
        let alert = inner
            .get_mut(id)
            .ok_or_else(|| EngineError::AlertNotFound(id.to_string()))?;
        alert.alert_count += 1;
        alert.last_seen = seen_at;
        alert.updated_at = seen_at;
        Ok(alert.clone())
    }

    fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        let inner = self.lock()?;
        let mut stale: Vec<AlertRecord> = inner
            .values()
            .filter(|a| a.status == AlertStatus::New && a.last_seen < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.last_seen.cmp(&b.last_seen));
        Ok(stale)
    }
}

// =============================================================================
// SQLite implementation
// =============================================================================

/// SQLite-backed repository.
///
/// The full record lives in the `data` JSON column; the typed columns exist
/// for indexing and filtering. Timestamp columns hold Unix epoch seconds so
/// range comparisons stay numeric.
pub struct SqliteAlertRepository {
    conn: Mutex<Connection>,
}

impl SqliteAlertRepository {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let repo = SqliteAlertRepository {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                dedup_key TEXT NOT NULL,
                rule_id TEXT NOT NULL,
                severity TEXT NOT NULL,
                status TEXT NOT NULL,
                triggered_at INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                data TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_alerts_dedup
                ON alerts(dedup_key, triggered_at DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_listing
                ON alerts(triggered_at DESC);
            CREATE INDEX IF NOT EXISTS idx_alerts_stale
                ON alerts(status, last_seen);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Persistence("sqlite connection lock poisoned".to_string()))
    }

    fn store(&self, conn: &Connection, alert: &AlertRecord, replace: bool) -> Result<()> {
        let data = serde_json::to_string(alert)?;
        let sql = if replace {
            "INSERT OR REPLACE INTO alerts
               (id, dedup_key, rule_id, severity, status, triggered_at, last_seen, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        } else {
            "INSERT INTO alerts
               (id, dedup_key, rule_id, severity, status, triggered_at, last_seen, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        };
        conn.execute(
            sql,
            params![
                alert.id,
                alert.dedup_key,
                alert.rule_id,
                alert.severity.as_str(),
                alert.status.as_str(),
                alert.triggered_at.timestamp(),
                alert.last_seen.timestamp(),
                data,
            ],
        )?;
        Ok(())
    }
}

fn decode(data: String) -> Result<AlertRecord> {
    Ok(serde_json::from_str(&data)?)
}

impl AlertRepository for SqliteAlertRepository {
    fn create(&self, alert: &AlertRecord) -> Result<()> {
        let conn = self.lock()?;
        self.store(&conn, alert, false)
    }

    fn get(&self, id: &str) -> Result<Option<AlertRecord>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM alerts WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        data.map(decode).transpose()
    }

    fn get_by_dedup_key(&self, dedup_key: &str) -> Result<Option<AlertRecord>> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM alerts WHERE dedup_key = ?1
                 ORDER BY triggered_at DESC LIMIT 1",
                params![dedup_key],
                |row| row.get(0),
            )
            .optional()?;
        data.map(decode).transpose()
    }

    fn list(&self, query: &AlertQuery) -> Result<Vec<AlertRecord>> {
        let mut sql = String::from("SELECT data FROM alerts WHERE 1=1");
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(severity) = query.severity {
            sql.push_str(" AND severity = ?");
            args.push(Box::new(severity.as_str().to_string()));
        }
        if let Some(rule_id) = &query.rule_id {
            sql.push_str(" AND rule_id = ?");
            args.push(Box::new(rule_id.clone()));
        }
        if let Some(from) = query.from {
            sql.push_str(" AND triggered_at >= ?");
            args.push(Box::new(from.timestamp()));
        }
        if let Some(to) = query.to {
            sql.push_str(" AND triggered_at < ?");
            args.push(Box::new(to.timestamp()));
        }
        sql.push_str(" ORDER BY triggered_at DESC LIMIT ? OFFSET ?");
        args.push(Box::new(query.effective_limit() as i64));
        args.push(Box::new(query.offset as i64));

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get::<_, String>(0),
        )?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row?)?);
        }
        Ok(out)
    }

    fn update_status(
        &self,
        id: &str,
        status: AlertStatus,
        actor: &str,
        comment: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AlertRecord> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM alerts WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let mut alert = data
            .map(decode)
            .transpose()?
            .ok_or_else(|| EngineError::AlertNotFound(id.to_string()))?;

        if alert.apply_status(status, actor, comment, now) {
            self.store(&conn, &alert, true)?;
        }
        Ok(alert)
    }

    fn increment_dedup(&self, id: &str, seen_at: DateTime<Utc>) -> Result<AlertRecord> {
        let conn = self.lock()?;
        let data: Option<String> = conn
            .query_row("SELECT data FROM alerts WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        let mut alert = data
            .map(decode)
            .transpose()?
            .ok_or_else(|| EngineError::AlertNotFound(id.to_string()))?;

        alert.alert_count += 1;
        alert.last_seen = seen_at;
        alert.updated_at = seen_at;
        self.store(&conn, &alert, true)?;
        Ok(alert)
    }

    fn find_stale(&self, older_than: DateTime<Utc>) -> Result<Vec<AlertRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT data FROM alerts WHERE status = 'new' AND last_seen < ?1
             ORDER BY last_seen ASC",
        )?;
        let rows = stmt.query_map(params![older_than.timestamp()], |row| {
            row.get::<_, String>(0)
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(decode(row?)?);
        }
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::StatusHistoryEntry;
    use chrono::{Duration, TimeZone};
    use serde_json::Map;

    fn alert(id: &str, rule_id: &str, severity: Severity, at: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            id: id.to_string(),
            rule_id: rule_id.to_string(),
            rule_name: rule_id.to_string(),
            severity,
            status: AlertStatus::New,
            triggered_at: at,
            source: "fw-01".to_string(),
            correlation_context: Map::new(),
            matched_conditions: vec!["protocol:equals:ssh".to_string()],
            aggregation_count: Some(5),
            aggregated_value: Some(5.0),
            dedup_key: format!("{rule_id}:src"),
            alert_count: 1,
            first_seen: at,
            last_seen: at,
            status_history: vec![StatusHistoryEntry {
                status: AlertStatus::New,
                timestamp: at,
                actor: "system".to_string(),
            }],
            acknowledged_at: None,
            investigation_started_at: None,
            resolved_at: None,
            closed_at: None,
            false_positive_at: None,
            resolution_comment: None,
            false_positive_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn repositories() -> Vec<Box<dyn AlertRepository>> {
        vec![
            Box::new(MemoryAlertRepository::new()),
            Box::new(SqliteAlertRepository::open_in_memory().unwrap()),
        ]
    }

    #[test]
    fn create_get_round_trip() {
        for repo in repositories() {
            let a = alert("a-1", "r-1", Severity::High, t0());
            repo.create(&a).unwrap();
            assert_eq!(repo.get("a-1").unwrap().as_ref(), Some(&a));
            assert_eq!(repo.get("missing").unwrap(), None);
            assert_eq!(repo.get_by_dedup_key("r-1:src").unwrap().as_ref(), Some(&a));
        }
    }

    #[test]
    fn list_filters_and_paginates() {
        for repo in repositories() {
            for i in 0..5 {
                let mut a = alert(
                    &format!("a-{i}"),
                    if i < 3 { "r-1" } else { "r-2" },
                    if i % 2 == 0 { Severity::High } else { Severity::Low },
                    t0() + Duration::minutes(i),
                );
                a.dedup_key = format!("k-{i}");
                repo.create(&a).unwrap();
            }

            let all = repo.list(&AlertQuery::default()).unwrap();
            assert_eq!(all.len(), 5);
            // Newest first
            assert_eq!(all[0].id, "a-4");

            let high = repo
                .list(&AlertQuery {
                    severity: Some(Severity::High),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(high.len(), 3);

            let r1 = repo
                .list(&AlertQuery {
                    rule_id: Some("r-1".to_string()),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(r1.len(), 3);

            let windowed = repo
                .list(&AlertQuery {
                    from: Some(t0() + Duration::minutes(1)),
                    to: Some(t0() + Duration::minutes(4)),
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(windowed.len(), 3);

            let page = repo
                .list(&AlertQuery {
                    offset: 2,
                    limit: 2,
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(page.len(), 2);
            assert_eq!(page[0].id, "a-2");
        }
    }

    #[test]
    fn update_status_appends_exactly_one_entry() {
        for repo in repositories() {
            repo.create(&alert("a-1", "r-1", Severity::High, t0())).unwrap();

            let updated = repo
                .update_status("a-1", AlertStatus::Acknowledged, "analyst", None, t0())
                .unwrap();
            assert_eq!(updated.status_history.len(), 2);

            // No-op when unchanged: nothing appended.
            let again = repo
                .update_status("a-1", AlertStatus::Acknowledged, "analyst", None, t0())
                .unwrap();
            assert_eq!(again.status_history.len(), 2);

            let resolved = repo
                .update_status(
                    "a-1",
                    AlertStatus::Resolved,
                    "analyst",
                    Some("fixed upstream"),
                    t0(),
                )
                .unwrap();
            assert_eq!(resolved.status_history.len(), 3);
            assert_eq!(resolved.resolution_comment.as_deref(), Some("fixed upstream"));

            // History entries never mutate.
            assert_eq!(resolved.status_history[0].status, AlertStatus::New);
            assert_eq!(resolved.status_history[1].status, AlertStatus::Acknowledged);
        }
    }

    #[test]
    fn update_status_unknown_id_is_not_found() {
        for repo in repositories() {
            let err = repo
                .update_status("ghost", AlertStatus::Closed, "x", None, t0())
                .unwrap_err();
            assert!(matches!(err, EngineError::AlertNotFound(_)));
        }
    }

    #[test]
    fn increment_dedup_bumps_count_without_history() {
        for repo in repositories() {
            repo.create(&alert("a-1", "r-1", Severity::High, t0())).unwrap();

            let later = t0() + Duration::minutes(2);
            let updated = repo.increment_dedup("a-1", later).unwrap();
            assert_eq!(updated.alert_count, 2);
            assert_eq!(updated.first_seen, t0());
            assert_eq!(updated.last_seen, later);
            assert_eq!(updated.status_history.len(), 1);
        }
    }

    #[test]
    fn find_stale_returns_old_new_alerts() {
        for repo in repositories() {
            repo.create(&alert("old", "r-1", Severity::High, t0())).unwrap();
            let mut fresh = alert("fresh", "r-1", Severity::High, t0() + Duration::hours(2));
            fresh.dedup_key = "k-fresh".to_string();
            repo.create(&fresh).unwrap();
            let mut acked = alert("acked", "r-1", Severity::High, t0());
            acked.dedup_key = "k-acked".to_string();
            repo.create(&acked).unwrap();
            repo.update_status("acked", AlertStatus::Acknowledged, "x", None, t0())
                .unwrap();

            let stale = repo.find_stale(t0() + Duration::hours(1)).unwrap();
            assert_eq!(stale.len(), 1);
            assert_eq!(stale[0].id, "old");
        }
    }
}
