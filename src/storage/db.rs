use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use crate::{
    error::Result,
    storage::models::{
        AuditRecord, NewPoint, Point, PointSource, PointStatus, QueueStatus, RenewalQueueItem, System,
    },
};

const SYSTEM_COLUMNS: &str =
    "id, external_id, panel_username, panel_password, active_points, max_points, last_renewed_at";

const POINT_COLUMNS: &str =
    "id, system_id, username, password, expires_at, status, source, superseded_by, created_at, updated_at";

const QUEUE_COLUMNS: &str = "id, system_id, status, trigger, expiry_window, enqueued_at, started_at, \
     completed_at, not_before, attempts, last_error, error_kind, cancel_requested";

/// Local store for systems, points, the renewal queue mirror and the audit log.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn new(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS systems (
                id TEXT PRIMARY KEY,
                external_id TEXT NOT NULL UNIQUE,
                panel_username TEXT NOT NULL,
                panel_password TEXT NOT NULL,
                active_points INTEGER NOT NULL DEFAULT 0,
                max_points INTEGER NOT NULL DEFAULT 0,
                last_renewed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS points (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                system_id TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                status TEXT NOT NULL,
                source TEXT NOT NULL,
                superseded_by INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                FOREIGN KEY (system_id) REFERENCES systems(id)
            );

            CREATE TABLE IF NOT EXISTS renewal_queue (
                id INTEGER PRIMARY KEY,
                system_id TEXT NOT NULL,
                status TEXT NOT NULL,
                trigger TEXT NOT NULL,
                expiry_window TEXT,
                enqueued_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                not_before TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                error_kind TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                system_id TEXT NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                expires_at TEXT,
                method TEXT NOT NULL,
                raw_digest TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_points_system ON points(system_id, status);
            CREATE INDEX IF NOT EXISTS idx_points_username ON points(username);
            CREATE INDEX IF NOT EXISTS idx_queue_system ON renewal_queue(system_id);",
        )?;

        Ok(())
    }

    // ----- systems -----

    pub fn save_system(&self, system: &System) -> Result<()> {
        self.conn.execute(
            "INSERT INTO systems
             (id, external_id, panel_username, panel_password, active_points, max_points, last_renewed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                external_id = excluded.external_id,
                panel_username = excluded.panel_username,
                panel_password = excluded.panel_password,
                active_points = excluded.active_points,
                max_points = excluded.max_points,
                last_renewed_at = excluded.last_renewed_at",
            params![
                system.id,
                system.external_id,
                system.panel_username,
                system.panel_password,
                system.active_points,
                system.max_points,
                system.last_renewed_at.map(fmt_ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_system(&self, id: &str) -> Result<Option<System>> {
        let sql = format!("SELECT {} FROM systems WHERE id = ?1", SYSTEM_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], system_from_row).optional()?)
    }

    pub fn get_system_by_external_id(&self, external_id: &str) -> Result<Option<System>> {
        let sql = format!("SELECT {} FROM systems WHERE external_id = ?1", SYSTEM_COLUMNS);
        Ok(self.conn.query_row(&sql, [external_id], system_from_row).optional()?)
    }

    pub fn list_systems(&self) -> Result<Vec<System>> {
        let sql = format!("SELECT {} FROM systems ORDER BY id", SYSTEM_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let systems = stmt
            .query_map([], system_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(systems)
    }

    /// Overwrite only the point counts, leaving renewal bookkeeping alone.
    pub fn set_system_counts(&self, id: &str, active_points: u32, max_points: u32) -> Result<()> {
        self.conn.execute(
            "UPDATE systems SET active_points = ?1, max_points = ?2 WHERE id = ?3",
            params![active_points, max_points, id],
        )?;
        Ok(())
    }

    // ----- points -----

    pub fn insert_point(&self, point: &NewPoint) -> Result<Point> {
        let now = Utc::now();
        self.conn.execute(
            "INSERT INTO points
             (system_id, username, password, expires_at, status, source, superseded_by, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?7)",
            params![
                point.system_id,
                point.username,
                point.password,
                fmt_ts(point.expires_at),
                PointStatus::Active.to_string(),
                point.source.to_string(),
                fmt_ts(now),
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        self.recount_active_points(&point.system_id)?;

        Ok(Point {
            id,
            system_id: point.system_id.clone(),
            username: point.username.clone(),
            password: point.password.clone(),
            expires_at: trunc_secs(point.expires_at),
            status: PointStatus::Active,
            source: point.source,
            superseded_by: None,
            created_at: trunc_secs(now),
            updated_at: trunc_secs(now),
        })
    }

    pub fn get_point(&self, id: i64) -> Result<Option<Point>> {
        let sql = format!("SELECT {} FROM points WHERE id = ?1", POINT_COLUMNS);
        Ok(self.conn.query_row(&sql, [id], point_from_row).optional()?)
    }

    pub fn list_points(&self) -> Result<Vec<Point>> {
        let sql = format!("SELECT {} FROM points ORDER BY id", POINT_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let points = stmt
            .query_map([], point_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(points)
    }

    pub fn get_active_points(&self, system_id: &str) -> Result<Vec<Point>> {
        let sql = format!(
            "SELECT {} FROM points WHERE system_id = ?1 AND status = 'active' ORDER BY expires_at",
            POINT_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let points = stmt
            .query_map([system_id], point_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Most recent point carrying this username.
    pub fn get_latest_point_by_username(&self, username: &str) -> Result<Option<Point>> {
        let sql = format!(
            "SELECT {} FROM points WHERE username = ?1 ORDER BY id DESC LIMIT 1",
            POINT_COLUMNS
        );
        Ok(self.conn.query_row(&sql, [username], point_from_row).optional()?)
    }

    /// Nearest expiry among each system's active points, soonest first.
    pub fn get_nearest_expiries(&self) -> Result<Vec<(System, DateTime<Utc>)>> {
        let mut nearest: Vec<(System, DateTime<Utc>)> = Vec::new();

        for system in self.list_systems()? {
            let points = self.get_active_points(&system.id)?;
            if let Some(expiry) = points.iter().map(|p| p.expires_at).min() {
                nearest.push((system, expiry));
            }
        }

        nearest.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.id.cmp(&b.0.id)));
        Ok(nearest)
    }

    pub fn set_point_source(&self, id: i64, source: PointSource) -> Result<()> {
        self.conn.execute(
            "UPDATE points SET source = ?1, updated_at = ?2 WHERE id = ?3",
            params![source.to_string(), fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Overwrite the mutable fields of a point with values pulled from elsewhere.
    pub fn update_point(
        &self,
        id: i64,
        password: &str,
        expires_at: DateTime<Utc>,
        status: PointStatus,
        source: PointSource,
    ) -> Result<()> {
        let system_id: String = self.conn.query_row(
            "UPDATE points SET password = ?1, expires_at = ?2, status = ?3, source = ?4, updated_at = ?5
             WHERE id = ?6 RETURNING system_id",
            params![
                password,
                fmt_ts(expires_at),
                status.to_string(),
                source.to_string(),
                fmt_ts(Utc::now()),
                id,
            ],
            |row| row.get(0),
        )?;
        self.recount_active_points(&system_id)?;
        Ok(())
    }

    /// Insert the renewed point, supersede the ones it replaces and update the
    /// system's bookkeeping, all in one transaction.
    pub fn apply_renewal(&self, point: &NewPoint, supersedes: &[i64], renewed_at: DateTime<Utc>) -> Result<Point> {
        let tx = self.conn.unchecked_transaction()?;

        let inserted = self.insert_point(point)?;
        for old_id in supersedes {
            self.conn.execute(
                "UPDATE points SET status = 'inactive', superseded_by = ?1, updated_at = ?2
                 WHERE id = ?3 AND system_id = ?4",
                params![inserted.id, fmt_ts(renewed_at), old_id, point.system_id],
            )?;
        }
        self.recount_active_points(&point.system_id)?;
        self.conn.execute(
            "UPDATE systems SET last_renewed_at = ?1 WHERE id = ?2",
            params![fmt_ts(renewed_at), point.system_id],
        )?;

        tx.commit()?;
        Ok(inserted)
    }

    fn recount_active_points(&self, system_id: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE systems SET active_points =
                (SELECT COUNT(*) FROM points WHERE system_id = ?1 AND status = 'active')
             WHERE id = ?1",
            [system_id],
        )?;
        Ok(())
    }

    // ----- renewal queue mirror -----

    pub fn save_queue_item(&self, item: &RenewalQueueItem) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO renewal_queue
             (id, system_id, status, trigger, expiry_window, enqueued_at, started_at,
              completed_at, not_before, attempts, last_error, error_kind, cancel_requested)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                item.id,
                item.system_id,
                item.status.to_string(),
                item.trigger.to_string(),
                item.expiry_window.map(fmt_ts),
                fmt_ts(item.enqueued_at),
                item.started_at.map(fmt_ts),
                item.completed_at.map(fmt_ts),
                fmt_ts(item.not_before),
                item.attempts,
                item.last_error,
                item.error_kind.map(|k| k.to_string()),
                item.cancel_requested,
            ],
        )?;
        Ok(())
    }

    pub fn load_queue_items(&self) -> Result<Vec<RenewalQueueItem>> {
        let sql = format!("SELECT {} FROM renewal_queue ORDER BY id", QUEUE_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;
        let items = stmt
            .query_map([], queue_item_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(items)
    }

    /// Drop terminal items that finished before `cutoff`. Returns how many went.
    pub fn delete_queue_items_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let removed = self.conn.execute(
            "DELETE FROM renewal_queue
             WHERE status IN ('completed', 'error') AND completed_at IS NOT NULL AND completed_at < ?1",
            [fmt_ts(cutoff)],
        )?;
        Ok(removed)
    }

    // ----- audit -----

    pub fn save_audit_record(&self, record: &AuditRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO audit_log
             (system_id, username, password, expires_at, method, raw_digest, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.system_id,
                record.username,
                record.password,
                record.expires_at,
                record.method.to_string(),
                record.raw_digest,
                fmt_ts(record.recorded_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_audit_history(&self, limit: usize) -> Result<Vec<AuditRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT system_id, username, password, expires_at, method, raw_digest, recorded_at
             FROM audit_log
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let records = stmt
            .query_map([limit as i64], |row| {
                Ok(AuditRecord {
                    system_id: row.get(0)?,
                    username: row.get(1)?,
                    password: row.get(2)?,
                    expires_at: row.get(3)?,
                    method: parse_enum(row, 4)?,
                    raw_digest: row.get(5)?,
                    recorded_at: parse_ts(row, 6)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        Ok(DatabaseStats {
            total_systems: count("SELECT COUNT(*) FROM systems")?,
            total_points: count("SELECT COUNT(*) FROM points")?,
            active_points: count("SELECT COUNT(*) FROM points WHERE status = 'active'")?,
            queued_items: count("SELECT COUNT(*) FROM renewal_queue WHERE status IN ('waiting', 'processing')")?,
            failed_items: count("SELECT COUNT(*) FROM renewal_queue WHERE status = 'error'")?,
            renewals_recorded: count("SELECT COUNT(*) FROM audit_log")?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_systems: usize,
    pub total_points: usize,
    pub active_points: usize,
    pub queued_items: usize,
    pub failed_items: usize,
    pub renewals_recorded: usize,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn trunc_secs(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(ts.timestamp(), 0).unwrap_or(ts)
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

#[derive(Debug)]
struct BadValue(String);

impl std::fmt::Display for BadValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for BadValue {}

fn parse_ts(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn parse_enum<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| conversion_error(idx, BadValue(e.to_string())))
}

fn system_from_row(row: &Row) -> rusqlite::Result<System> {
    Ok(System {
        id: row.get(0)?,
        external_id: row.get(1)?,
        panel_username: row.get(2)?,
        panel_password: row.get(3)?,
        active_points: row.get(4)?,
        max_points: row.get(5)?,
        last_renewed_at: parse_opt_ts(row, 6)?,
    })
}

fn point_from_row(row: &Row) -> rusqlite::Result<Point> {
    Ok(Point {
        id: row.get(0)?,
        system_id: row.get(1)?,
        username: row.get(2)?,
        password: row.get(3)?,
        expires_at: parse_ts(row, 4)?,
        status: parse_enum(row, 5)?,
        source: parse_enum(row, 6)?,
        superseded_by: row.get(7)?,
        created_at: parse_ts(row, 8)?,
        updated_at: parse_ts(row, 9)?,
    })
}

fn queue_item_from_row(row: &Row) -> rusqlite::Result<RenewalQueueItem> {
    let error_kind: Option<String> = row.get(11)?;
    Ok(RenewalQueueItem {
        id: row.get(0)?,
        system_id: row.get(1)?,
        status: parse_enum::<QueueStatus>(row, 2)?,
        trigger: parse_enum(row, 3)?,
        expiry_window: parse_opt_ts(row, 4)?,
        enqueued_at: parse_ts(row, 5)?,
        started_at: parse_opt_ts(row, 6)?,
        completed_at: parse_opt_ts(row, 7)?,
        not_before: parse_ts(row, 8)?,
        attempts: row.get(9)?,
        last_error: row.get(10)?,
        error_kind: error_kind.and_then(|k| k.parse().ok()),
        cancel_requested: row.get(12)?,
    })
}
