//! Durable check statistics (SQLite).

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Datelike, Local, Timelike, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::error::Result;
use crate::events::CheckOutcome;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckRecord {
    pub id: i64,
    pub cycle_id: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub slots_found: bool,
    pub slot_labels: Vec<String>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total: u64,
    pub successful: u64,
    pub slots_found: u64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeatCell {
    /// 0 = Sunday.
    pub weekday: u32,
    pub hour: u32,
    pub count: u64,
}

pub struct StatsStore {
    conn: Mutex<Connection>,
}

impl StatsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_id INTEGER NOT NULL,
                timestamp TEXT NOT NULL,
                local_hour INTEGER NOT NULL,
                local_weekday INTEGER NOT NULL,
                success INTEGER NOT NULL,
                slots_found INTEGER NOT NULL,
                slot_labels TEXT NOT NULL DEFAULT '[]',
                duration_ms INTEGER NOT NULL,
                error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_checks_timestamp ON checks(timestamp)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Recovers from a poisoned lock; the connection itself stays usable.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("[Store] Connection mutex was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn record(&self, outcome: &CheckOutcome) -> Result<i64> {
        let local = outcome.timestamp.with_timezone(&Local);
        let labels = serde_json::to_string(outcome.slot_labels.as_deref().unwrap_or(&[]))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO checks (cycle_id, timestamp, local_hour, local_weekday, success, slots_found, slot_labels, duration_ms, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                outcome.cycle_id as i64,
                outcome.timestamp.to_rfc3339(),
                local.hour(),
                local.weekday().num_days_from_sunday(),
                outcome.success,
                outcome.slots_found,
                labels,
                outcome.duration_ms as i64,
                outcome.error,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn recent(&self, limit: usize) -> Result<Vec<CheckRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, cycle_id, timestamp, success, slots_found, slot_labels, duration_ms, error
             FROM checks ORDER BY timestamp DESC, id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let timestamp: String = row.get(2)?;
            let labels: String = row.get(5)?;
            Ok(CheckRecord {
                id: row.get(0)?,
                cycle_id: row.get::<_, i64>(1)? as u64,
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_default(),
                success: row.get(3)?,
                slots_found: row.get(4)?,
                slot_labels: serde_json::from_str(&labels).unwrap_or_default(),
                duration_ms: row.get::<_, i64>(6)? as u64,
                error: row.get(7)?,
            })
        })?;

        let mut records = Vec::new();
        for r in rows {
            records.push(r?);
        }
        Ok(records)
    }

    pub fn summary(&self) -> Result<StatsSummary> {
        let conn = self.lock();
        let (total, successful, slots_found): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(success), 0), COALESCE(SUM(slots_found), 0) FROM checks",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let avg_duration_ms: Option<f64> = conn.query_row(
            "SELECT AVG(duration_ms) FROM checks WHERE success = 1",
            [],
            |row| row.get(0),
        )?;

        let success_rate = if total > 0 { successful as f64 * 100.0 / total as f64 } else { 0.0 };
        Ok(StatsSummary {
            total: total as u64,
            successful: successful as u64,
            slots_found: slots_found as u64,
            success_rate,
            avg_duration_ms: avg_duration_ms.unwrap_or(0.0),
        })
    }

    /// Slots-found counts per local hour, hours without finds omitted.
    pub fn slots_by_hour(&self) -> Result<Vec<(u32, u64)>> {
        self.grouped("SELECT local_hour, COUNT(*) FROM checks WHERE slots_found = 1 GROUP BY local_hour ORDER BY local_hour")
    }

    /// Slots-found counts per local weekday, 0 = Sunday.
    pub fn slots_by_weekday(&self) -> Result<Vec<(u32, u64)>> {
        self.grouped(
            "SELECT local_weekday, COUNT(*) FROM checks WHERE slots_found = 1 GROUP BY local_weekday ORDER BY local_weekday",
        )
    }

    pub fn heatmap(&self) -> Result<Vec<HeatCell>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT local_weekday, local_hour, COUNT(*) FROM checks WHERE slots_found = 1
             GROUP BY local_weekday, local_hour ORDER BY local_weekday, local_hour",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(HeatCell {
                weekday: row.get(0)?,
                hour: row.get(1)?,
                count: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut cells = Vec::new();
        for r in rows {
            cells.push(r?);
        }
        Ok(cells)
    }

    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock();
        Ok(conn.execute("DELETE FROM checks", [])?)
    }

    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        Ok(conn
            .query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    fn grouped(&self, sql: &str) -> Result<Vec<(u32, u64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)? as u64)))?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn outcome(cycle_id: u64, at: DateTime<Utc>, found: bool, success: bool, duration_ms: u64) -> CheckOutcome {
        CheckOutcome {
            cycle_id,
            timestamp: at,
            success,
            slots_found: found,
            slot_labels: found.then(|| vec!["7 февраля, Сб".to_string()]),
            duration_ms,
            error: (!success).then(|| "recovery exhausted".to_string()),
        }
    }

    #[test]
    fn test_record_and_recent_newest_first() {
        let store = StatsStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 7, 10, 0, 0).unwrap();
        store.record(&outcome(1, t0, false, true, 1000)).unwrap();
        store.record(&outcome(2, t0 + Duration::minutes(1), true, true, 3000)).unwrap();
        store.record(&outcome(3, t0 + Duration::minutes(2), false, false, 500)).unwrap();

        let recent = store.recent(2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].cycle_id, 3);
        assert_eq!(recent[0].error.as_deref(), Some("recovery exhausted"));
        assert_eq!(recent[1].slot_labels, vec!["7 февраля, Сб".to_string()]);
        assert_eq!(recent[1].timestamp, t0 + Duration::minutes(1));
    }

    #[test]
    fn test_summary() {
        let store = StatsStore::open_in_memory().unwrap();
        assert_eq!(store.summary().unwrap(), StatsSummary::default());

        let t0 = Utc::now();
        store.record(&outcome(1, t0, false, true, 1000)).unwrap();
        store.record(&outcome(2, t0, true, true, 3000)).unwrap();
        store.record(&outcome(3, t0, false, false, 9000)).unwrap();
        store.record(&outcome(4, t0, false, false, 9000)).unwrap();

        let s = store.summary().unwrap();
        assert_eq!(s.total, 4);
        assert_eq!(s.successful, 2);
        assert_eq!(s.slots_found, 1);
        assert!((s.success_rate - 50.0).abs() < 1e-9);
        assert!((s.avg_duration_ms - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_grouping_by_local_time() {
        let store = StatsStore::open_in_memory().unwrap();
        let t0 = Utc.with_ymd_and_hms(2026, 2, 7, 10, 15, 0).unwrap();
        store.record(&outcome(1, t0, true, true, 100)).unwrap();
        store.record(&outcome(2, t0 + Duration::minutes(5), true, true, 100)).unwrap();
        store.record(&outcome(3, t0, false, true, 100)).unwrap();

        let local = t0.with_timezone(&Local);
        assert_eq!(store.slots_by_hour().unwrap(), vec![(local.hour(), 2)]);
        assert_eq!(store.slots_by_weekday().unwrap(), vec![(local.weekday().num_days_from_sunday(), 2)]);
        assert_eq!(
            store.heatmap().unwrap(),
            vec![HeatCell { weekday: local.weekday().num_days_from_sunday(), hour: local.hour(), count: 2 }]
        );
    }

    #[test]
    fn test_clear_keeps_meta() {
        let store = StatsStore::open_in_memory().unwrap();
        store.record(&outcome(1, Utc::now(), true, true, 100)).unwrap();
        store.set_meta("last_signature", "abc").unwrap();
        store.set_meta("last_signature", "def").unwrap();

        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.recent(10).unwrap().is_empty());
        assert_eq!(store.get_meta("last_signature").unwrap().as_deref(), Some("def"));
        assert_eq!(store.get_meta("missing").unwrap(), None);
    }
}
