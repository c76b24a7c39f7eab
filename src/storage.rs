//! Durable detection records and alert delivery bookkeeping.
//!
//! A record is immutable once written except for `alert_sent` and
//! `alert_sent_at`, which flip exactly once.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{TimeZone, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use serde::Serialize;

use crate::clock::epoch_now;
use crate::detect::{BoundingBox, ClassLabel, Detection};

const HOUR_SECS: f64 = 3_600.0;
const DAY_SECS: f64 = 86_400.0;

/// Persisted projection of a `Detection`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub class_label: ClassLabel,
    pub confidence: f32,
    pub bounding_box: BoundingBox,
    pub capture_timestamp: f64,
    pub capture_datetime: String,
    pub image_path: Option<PathBuf>,
    pub alert_sent: bool,
    pub alert_sent_at: Option<f64>,
    pub created_at: f64,
}

/// One dispatch attempt for one alert.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertAttempt {
    pub alert_id: u64,
    pub record_id: Option<i64>,
    pub class_label: ClassLabel,
    /// 1-based attempt number.
    pub attempt: u32,
    pub attempted_at: f64,
    pub channel_results: BTreeMap<String, bool>,
}

impl AlertAttempt {
    pub fn succeeded(&self) -> bool {
        self.channel_results.values().any(|ok| *ok)
    }
}

/// Filter for `query_detections`. Unset fields match everything; results
/// are newest first.
#[derive(Clone, Debug, Default)]
pub struct DetectionQuery {
    pub class_label: Option<ClassLabel>,
    pub since: Option<f64>,
    pub until: Option<f64>,
    pub alert_sent: Option<bool>,
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ChannelDeliveryStats {
    pub attempts: u64,
    pub successes: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionStatistics {
    pub total_detections: u64,
    pub detections_by_class: BTreeMap<String, u64>,
    pub detections_last_24h: u64,
    pub detections_last_7d: u64,
    pub alerts_sent: u64,
    pub delivery_attempts: u64,
    pub failed_attempts: u64,
    pub channels: BTreeMap<String, ChannelDeliveryStats>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub records_deleted: usize,
    pub attempts_deleted: usize,
    pub images_deleted: usize,
}

pub trait DetectionStore: Send {
    /// Persist one detection and return its record id.
    fn save_detection(
        &mut self,
        detection: &Detection,
        image_path: Option<&Path>,
        alert_sent: bool,
    ) -> Result<i64>;

    /// Flip `alert_sent` for a record. Returns `false` when the record is
    /// missing or was already marked.
    fn mark_alert_sent(&mut self, record_id: i64, sent_at: f64) -> Result<bool>;

    fn record_alert_attempt(&mut self, attempt: &AlertAttempt) -> Result<()>;

    /// Records captured within the last `hours`, newest first.
    fn get_recent_detections(&mut self, hours: u32) -> Result<Vec<DetectionRecord>>;

    fn query_detections(&mut self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>>;

    fn get_detection_statistics(&mut self) -> Result<DetectionStatistics>;

    /// Latest `alert_sent_at` per class, used to restore cooldowns.
    fn last_alert_times(&mut self) -> Result<HashMap<ClassLabel, f64>>;

    /// Drop records older than `retention_days` along with snapshots that no
    /// surviving record references.
    fn cleanup_old_records(&mut self, retention_days: u32) -> Result<CleanupReport>;
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    /// Open (or create) the database. `":memory:"` opens a private
    /// in-memory database.
    pub fn open(db_path: &str) -> Result<Self> {
        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .with_context(|| format!("create database directory {}", parent.display()))?;
                }
            }
        }
        let conn = Connection::open(db_path).with_context(|| format!("open database {}", db_path))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              class_name TEXT NOT NULL,
              confidence REAL NOT NULL,
              bbox_x1 INTEGER NOT NULL,
              bbox_y1 INTEGER NOT NULL,
              bbox_x2 INTEGER NOT NULL,
              bbox_y2 INTEGER NOT NULL,
              capture_timestamp REAL NOT NULL,
              capture_datetime TEXT NOT NULL,
              image_path TEXT,
              alert_sent INTEGER NOT NULL DEFAULT 0,
              alert_sent_at REAL,
              created_at REAL NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert_attempts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              alert_id INTEGER NOT NULL,
              detection_id INTEGER,
              class_name TEXT NOT NULL,
              attempt INTEGER NOT NULL,
              attempted_at REAL NOT NULL,
              success INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert_channel_results (
              attempt_id INTEGER NOT NULL,
              channel TEXT NOT NULL,
              success INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_capture ON detections(capture_timestamp);
            CREATE INDEX IF NOT EXISTS idx_detections_class ON detections(class_name);
            CREATE INDEX IF NOT EXISTS idx_attempts_time ON alert_attempts(attempted_at);
            CREATE INDEX IF NOT EXISTS idx_channel_results_attempt ON alert_channel_results(attempt_id);
            "#,
        )?;
        Ok(())
    }

    fn select_records(&self, where_sql: &str, values: Vec<Value>, limit: Option<usize>) -> Result<Vec<DetectionRecord>> {
        let mut sql = String::from(
            "SELECT id, class_name, confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2, \
             capture_timestamp, capture_datetime, image_path, alert_sent, alert_sent_at, created_at \
             FROM detections",
        );
        if !where_sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(where_sql);
        }
        sql.push_str(" ORDER BY capture_timestamp DESC, id DESC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let class_name: String = row.get(1)?;
            let bbox = BoundingBox::new(row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?)
                .ok_or_else(|| anyhow!("corrupt detection record: degenerate bounding box"))?;
            let image_path: Option<String> = row.get(9)?;
            let alert_sent: i64 = row.get(10)?;
            let confidence: f64 = row.get(2)?;
            out.push(DetectionRecord {
                id: row.get(0)?,
                class_label: class_name.parse()?,
                confidence: confidence as f32,
                bounding_box: bbox,
                capture_timestamp: row.get(7)?,
                capture_datetime: row.get(8)?,
                image_path: image_path.map(PathBuf::from),
                alert_sent: alert_sent != 0,
                alert_sent_at: row.get(11)?,
                created_at: row.get(12)?,
            });
        }
        Ok(out)
    }

    fn count(&self, sql: &str, values: Vec<Value>) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row(sql, params_from_iter(values), |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn save_detection(
        &mut self,
        detection: &Detection,
        image_path: Option<&Path>,
        alert_sent: bool,
    ) -> Result<i64> {
        let now = epoch_now();
        let bbox = detection.bounding_box;
        self.conn.execute(
            r#"
            INSERT INTO detections(class_name, confidence, bbox_x1, bbox_y1, bbox_x2, bbox_y2,
              capture_timestamp, capture_datetime, image_path, alert_sent, alert_sent_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                detection.class_label.as_str(),
                f64::from(detection.confidence),
                bbox.x1(),
                bbox.y1(),
                bbox.x2(),
                bbox.y2(),
                detection.frame_timestamp,
                capture_datetime(detection.frame_timestamp),
                image_path.map(|p| p.to_string_lossy().into_owned()),
                alert_sent as i64,
                if alert_sent { Some(now) } else { None },
                now,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn mark_alert_sent(&mut self, record_id: i64, sent_at: f64) -> Result<bool> {
        let changed = self.conn.execute(
            "UPDATE detections SET alert_sent = 1, alert_sent_at = ?1 WHERE id = ?2 AND alert_sent = 0",
            params![sent_at, record_id],
        )?;
        Ok(changed == 1)
    }

    fn record_alert_attempt(&mut self, attempt: &AlertAttempt) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO alert_attempts(alert_id, detection_id, class_name, attempt, attempted_at, success)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                attempt.alert_id as i64,
                attempt.record_id,
                attempt.class_label.as_str(),
                attempt.attempt,
                attempt.attempted_at,
                attempt.succeeded() as i64,
            ],
        )?;
        let attempt_id = tx.last_insert_rowid();
        for (channel, ok) in &attempt.channel_results {
            tx.execute(
                "INSERT INTO alert_channel_results(attempt_id, channel, success) VALUES (?1, ?2, ?3)",
                params![attempt_id, channel, *ok as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_recent_detections(&mut self, hours: u32) -> Result<Vec<DetectionRecord>> {
        let since = epoch_now() - f64::from(hours) * HOUR_SECS;
        self.select_records("capture_timestamp >= ?", vec![Value::Real(since)], None)
    }

    fn query_detections(&mut self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(class) = query.class_label {
            clauses.push("class_name = ?");
            values.push(Value::Text(class.as_str().to_string()));
        }
        if let Some(since) = query.since {
            clauses.push("capture_timestamp >= ?");
            values.push(Value::Real(since));
        }
        if let Some(until) = query.until {
            clauses.push("capture_timestamp < ?");
            values.push(Value::Real(until));
        }
        if let Some(sent) = query.alert_sent {
            clauses.push("alert_sent = ?");
            values.push(Value::Integer(sent as i64));
        }
        self.select_records(&clauses.join(" AND "), values, query.limit)
    }

    fn get_detection_statistics(&mut self) -> Result<DetectionStatistics> {
        let now = epoch_now();
        let mut stats = DetectionStatistics {
            total_detections: self.count("SELECT COUNT(*) FROM detections", Vec::new())?,
            detections_last_24h: self.count(
                "SELECT COUNT(*) FROM detections WHERE capture_timestamp >= ?1",
                vec![Value::Real(now - DAY_SECS)],
            )?,
            detections_last_7d: self.count(
                "SELECT COUNT(*) FROM detections WHERE capture_timestamp >= ?1",
                vec![Value::Real(now - 7.0 * DAY_SECS)],
            )?,
            alerts_sent: self.count("SELECT COUNT(*) FROM detections WHERE alert_sent = 1", Vec::new())?,
            delivery_attempts: self.count("SELECT COUNT(*) FROM alert_attempts", Vec::new())?,
            failed_attempts: self.count("SELECT COUNT(*) FROM alert_attempts WHERE success = 0", Vec::new())?,
            ..Default::default()
        };

        {
            let mut stmt = self
                .conn
                .prepare("SELECT class_name, COUNT(*) FROM detections GROUP BY class_name")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let class_name: String = row.get(0)?;
                let n: i64 = row.get(1)?;
                stats.detections_by_class.insert(class_name, n as u64);
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT channel, COUNT(*), COALESCE(SUM(success), 0) FROM alert_channel_results GROUP BY channel",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let channel: String = row.get(0)?;
            let attempts: i64 = row.get(1)?;
            let successes: i64 = row.get(2)?;
            stats.channels.insert(
                channel,
                ChannelDeliveryStats {
                    attempts: attempts as u64,
                    successes: successes as u64,
                },
            );
        }
        Ok(stats)
    }

    fn last_alert_times(&mut self) -> Result<HashMap<ClassLabel, f64>> {
        let mut stmt = self.conn.prepare(
            "SELECT class_name, MAX(alert_sent_at) FROM detections WHERE alert_sent = 1 AND alert_sent_at IS NOT NULL GROUP BY class_name",
        )?;
        let mut rows = stmt.query([])?;
        let mut out = HashMap::new();
        while let Some(row) = rows.next()? {
            let class_name: String = row.get(0)?;
            let at: f64 = row.get(1)?;
            match class_name.parse::<ClassLabel>() {
                Ok(class) => {
                    out.insert(class, at);
                }
                Err(err) => log::warn!("ignoring stored alert time: {}", err),
            }
        }
        Ok(out)
    }

    fn cleanup_old_records(&mut self, retention_days: u32) -> Result<CleanupReport> {
        let cutoff = epoch_now() - f64::from(retention_days) * DAY_SECS;

        let candidate_images: Vec<String> = {
            let mut stmt = self.conn.prepare(
                "SELECT DISTINCT image_path FROM detections WHERE capture_timestamp < ?1 AND image_path IS NOT NULL",
            )?;
            let mut rows = stmt.query(params![cutoff])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row.get(0)?);
            }
            out
        };

        let tx = self.conn.transaction()?;
        let records_deleted = tx.execute(
            "DELETE FROM detections WHERE capture_timestamp < ?1",
            params![cutoff],
        )?;
        tx.execute(
            "DELETE FROM alert_channel_results WHERE attempt_id IN (SELECT id FROM alert_attempts WHERE attempted_at < ?1)",
            params![cutoff],
        )?;
        let attempts_deleted = tx.execute(
            "DELETE FROM alert_attempts WHERE attempted_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;

        let mut images_deleted = 0;
        for image in candidate_images {
            let still_referenced = self.count(
                "SELECT COUNT(*) FROM detections WHERE image_path = ?1",
                vec![Value::Text(image.clone())],
            )? > 0;
            if !still_referenced && remove_image(Path::new(&image)) {
                images_deleted += 1;
            }
        }

        Ok(CleanupReport {
            records_deleted,
            attempts_deleted,
            images_deleted,
        })
    }
}

/// Store for tests and for running without a database.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    records: Vec<DetectionRecord>,
    attempts: Vec<AlertAttempt>,
    next_id: i64,
}

impl InMemoryDetectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> &[AlertAttempt] {
        &self.attempts
    }

    fn newest_first(mut records: Vec<DetectionRecord>) -> Vec<DetectionRecord> {
        records.sort_by(|a, b| {
            b.capture_timestamp
                .total_cmp(&a.capture_timestamp)
                .then(b.id.cmp(&a.id))
        });
        records
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn save_detection(
        &mut self,
        detection: &Detection,
        image_path: Option<&Path>,
        alert_sent: bool,
    ) -> Result<i64> {
        let now = epoch_now();
        self.next_id += 1;
        self.records.push(DetectionRecord {
            id: self.next_id,
            class_label: detection.class_label,
            confidence: detection.confidence,
            bounding_box: detection.bounding_box,
            capture_timestamp: detection.frame_timestamp,
            capture_datetime: capture_datetime(detection.frame_timestamp),
            image_path: image_path.map(Path::to_path_buf),
            alert_sent,
            alert_sent_at: alert_sent.then_some(now),
            created_at: now,
        });
        Ok(self.next_id)
    }

    fn mark_alert_sent(&mut self, record_id: i64, sent_at: f64) -> Result<bool> {
        match self
            .records
            .iter_mut()
            .find(|r| r.id == record_id && !r.alert_sent)
        {
            Some(record) => {
                record.alert_sent = true;
                record.alert_sent_at = Some(sent_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn record_alert_attempt(&mut self, attempt: &AlertAttempt) -> Result<()> {
        self.attempts.push(attempt.clone());
        Ok(())
    }

    fn get_recent_detections(&mut self, hours: u32) -> Result<Vec<DetectionRecord>> {
        self.query_detections(&DetectionQuery {
            since: Some(epoch_now() - f64::from(hours) * HOUR_SECS),
            ..Default::default()
        })
    }

    fn query_detections(&mut self, query: &DetectionQuery) -> Result<Vec<DetectionRecord>> {
        let matching = self
            .records
            .iter()
            .filter(|r| query.class_label.map_or(true, |c| r.class_label == c))
            .filter(|r| query.since.map_or(true, |t| r.capture_timestamp >= t))
            .filter(|r| query.until.map_or(true, |t| r.capture_timestamp < t))
            .filter(|r| query.alert_sent.map_or(true, |s| r.alert_sent == s))
            .cloned()
            .collect();
        let mut out = Self::newest_first(matching);
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn get_detection_statistics(&mut self) -> Result<DetectionStatistics> {
        let now = epoch_now();
        let mut stats = DetectionStatistics {
            total_detections: self.records.len() as u64,
            ..Default::default()
        };
        for record in &self.records {
            *stats
                .detections_by_class
                .entry(record.class_label.as_str().to_string())
                .or_default() += 1;
            if record.capture_timestamp >= now - DAY_SECS {
                stats.detections_last_24h += 1;
            }
            if record.capture_timestamp >= now - 7.0 * DAY_SECS {
                stats.detections_last_7d += 1;
            }
            if record.alert_sent {
                stats.alerts_sent += 1;
            }
        }
        for attempt in &self.attempts {
            stats.delivery_attempts += 1;
            if !attempt.succeeded() {
                stats.failed_attempts += 1;
            }
            for (channel, ok) in &attempt.channel_results {
                let entry = stats.channels.entry(channel.clone()).or_default();
                entry.attempts += 1;
                if *ok {
                    entry.successes += 1;
                }
            }
        }
        Ok(stats)
    }

    fn last_alert_times(&mut self) -> Result<HashMap<ClassLabel, f64>> {
        let mut out: HashMap<ClassLabel, f64> = HashMap::new();
        for record in &self.records {
            if let Some(at) = record.alert_sent_at {
                let entry = out.entry(record.class_label).or_insert(at);
                if at > *entry {
                    *entry = at;
                }
            }
        }
        Ok(out)
    }

    fn cleanup_old_records(&mut self, retention_days: u32) -> Result<CleanupReport> {
        let cutoff = epoch_now() - f64::from(retention_days) * DAY_SECS;
        let before = self.records.len();
        let (expired, kept): (Vec<_>, Vec<_>) = self
            .records
            .drain(..)
            .partition(|r| r.capture_timestamp < cutoff);
        self.records = kept;

        let attempts_before = self.attempts.len();
        self.attempts.retain(|a| a.attempted_at >= cutoff);

        let referenced: HashSet<&PathBuf> = self.records.iter().filter_map(|r| r.image_path.as_ref()).collect();
        let mut images: Vec<&PathBuf> = expired
            .iter()
            .filter_map(|r| r.image_path.as_ref())
            .filter(|p| !referenced.contains(p))
            .collect();
        images.sort();
        images.dedup();
        let images_deleted = images.into_iter().filter(|p| remove_image(p)).count();

        Ok(CleanupReport {
            records_deleted: before - self.records.len(),
            attempts_deleted: attempts_before - self.attempts.len(),
            images_deleted,
        })
    }
}

fn capture_datetime(ts: f64) -> String {
    let secs = ts.floor() as i64;
    let nanos = ((ts - ts.floor()) * 1e9) as u32;
    Utc.timestamp_opt(secs, nanos)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

fn remove_image(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            log::warn!("failed to delete snapshot {}: {}", path.display(), err);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(class: ClassLabel, confidence: f32, ts: f64) -> Detection {
        Detection {
            class_label: class,
            confidence,
            bounding_box: BoundingBox::new(10, 10, 50, 40).unwrap(),
            frame_timestamp: ts,
        }
    }

    fn stores() -> Result<Vec<Box<dyn DetectionStore>>> {
        Ok(vec![
            Box::new(SqliteDetectionStore::open(":memory:")?),
            Box::new(InMemoryDetectionStore::new()),
        ])
    }

    #[test]
    fn recent_detections_are_newest_first() -> Result<()> {
        let now = epoch_now();
        for mut store in stores()? {
            store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, now - 7200.0), None, false)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.6, now - 60.0), None, false)?;
            store.save_detection(&detection(ClassLabel::Mouse, 0.5, now - 3.0 * DAY_SECS), None, false)?;

            let recent = store.get_recent_detections(24)?;
            assert_eq!(recent.len(), 2);
            assert_eq!(recent[0].class_label, ClassLabel::RoofRat);
            assert_eq!(recent[1].class_label, ClassLabel::NorwayRat);
            assert!((recent[1].confidence - 0.9).abs() < 1e-6);
            assert_eq!(recent[1].bounding_box.as_array(), [10, 10, 50, 40]);
        }
        Ok(())
    }

    #[test]
    fn alert_sent_transitions_once() -> Result<()> {
        for mut store in stores()? {
            let id = store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, epoch_now()), None, false)?;
            assert!(store.mark_alert_sent(id, 100.0)?);
            assert!(!store.mark_alert_sent(id, 200.0)?);
            assert!(!store.mark_alert_sent(id + 100, 200.0)?);

            let records = store.query_detections(&DetectionQuery::default())?;
            assert!(records[0].alert_sent);
            assert_eq!(records[0].alert_sent_at, Some(100.0));
        }
        Ok(())
    }

    #[test]
    fn ids_are_unique_and_increasing() -> Result<()> {
        for mut store in stores()? {
            let a = store.save_detection(&detection(ClassLabel::Mouse, 0.5, 1.0), None, false)?;
            let b = store.save_detection(&detection(ClassLabel::Mouse, 0.5, 1.0), None, false)?;
            assert!(b > a);
        }
        Ok(())
    }

    #[test]
    fn query_filters_by_class_and_time() -> Result<()> {
        for mut store in stores()? {
            store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, 1_000.0), None, false)?;
            store.save_detection(&detection(ClassLabel::NorwayRat, 0.8, 2_000.0), None, true)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.7, 2_500.0), None, false)?;

            let rats = store.query_detections(&DetectionQuery {
                class_label: Some(ClassLabel::NorwayRat),
                ..Default::default()
            })?;
            assert_eq!(rats.len(), 2);
            assert_eq!(rats[0].capture_timestamp, 2_000.0);

            let window = store.query_detections(&DetectionQuery {
                since: Some(1_500.0),
                until: Some(2_500.0),
                ..Default::default()
            })?;
            assert_eq!(window.len(), 1);

            let alerted = store.query_detections(&DetectionQuery {
                alert_sent: Some(true),
                ..Default::default()
            })?;
            assert_eq!(alerted.len(), 1);

            let limited = store.query_detections(&DetectionQuery {
                limit: Some(1),
                ..Default::default()
            })?;
            assert_eq!(limited[0].class_label, ClassLabel::RoofRat);
        }
        Ok(())
    }

    #[test]
    fn statistics_include_channel_delivery() -> Result<()> {
        for mut store in stores()? {
            let now = epoch_now();
            let id = store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, now), None, false)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.7, now - 2.0 * DAY_SECS), None, false)?;

            let mut results = BTreeMap::new();
            results.insert("sms".to_string(), false);
            results.insert("email".to_string(), false);
            results.insert("push".to_string(), true);
            store.record_alert_attempt(&AlertAttempt {
                alert_id: 1,
                record_id: Some(id),
                class_label: ClassLabel::NorwayRat,
                attempt: 1,
                attempted_at: now,
                channel_results: results,
            })?;
            store.mark_alert_sent(id, now)?;

            let stats = store.get_detection_statistics()?;
            assert_eq!(stats.total_detections, 2);
            assert_eq!(stats.detections_last_24h, 1);
            assert_eq!(stats.detections_last_7d, 2);
            assert_eq!(stats.detections_by_class["norway_rat"], 1);
            assert_eq!(stats.alerts_sent, 1);
            assert_eq!(stats.delivery_attempts, 1);
            assert_eq!(stats.failed_attempts, 0);
            assert_eq!(stats.channels["push"], ChannelDeliveryStats { attempts: 1, successes: 1 });
            assert_eq!(stats.channels["sms"].successes, 0);
        }
        Ok(())
    }

    #[test]
    fn last_alert_times_take_the_latest_per_class() -> Result<()> {
        for mut store in stores()? {
            let a = store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, 1.0), None, false)?;
            let b = store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, 2.0), None, false)?;
            let c = store.save_detection(&detection(ClassLabel::Mouse, 0.9, 3.0), None, false)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.9, 3.0), None, false)?;
            store.mark_alert_sent(a, 500.0)?;
            store.mark_alert_sent(b, 900.0)?;
            store.mark_alert_sent(c, 700.0)?;

            let times = store.last_alert_times()?;
            assert_eq!(times.len(), 2);
            assert_eq!(times[&ClassLabel::NorwayRat], 900.0);
            assert_eq!(times[&ClassLabel::Mouse], 700.0);
        }
        Ok(())
    }

    #[test]
    fn cleanup_removes_expired_records_and_unshared_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for mut store in stores()? {
            let now = epoch_now();
            let old_only = dir.path().join("old.jpg");
            let shared = dir.path().join("shared.jpg");
            let fresh = dir.path().join("fresh.jpg");
            for p in [&old_only, &shared, &fresh] {
                fs::write(p, b"jpeg")?;
            }

            let old = now - 40.0 * DAY_SECS;
            store.save_detection(&detection(ClassLabel::NorwayRat, 0.9, old), Some(&old_only), true)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.9, old), Some(&shared), false)?;
            store.save_detection(&detection(ClassLabel::RoofRat, 0.9, now), Some(&shared), false)?;
            store.save_detection(&detection(ClassLabel::Mouse, 0.9, now), Some(&fresh), false)?;
            store.record_alert_attempt(&AlertAttempt {
                alert_id: 9,
                record_id: None,
                class_label: ClassLabel::NorwayRat,
                attempt: 1,
                attempted_at: old,
                channel_results: BTreeMap::new(),
            })?;

            let report = store.cleanup_old_records(30)?;
            assert_eq!(report.records_deleted, 2);
            assert_eq!(report.attempts_deleted, 1);
            assert_eq!(report.images_deleted, 1);
            assert!(!old_only.exists());
            assert!(shared.exists());
            assert!(fresh.exists());
            assert_eq!(store.query_detections(&DetectionQuery::default())?.len(), 2);
        }
        Ok(())
    }

    #[test]
    fn sqlite_store_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("detections.db");
        let path = path.to_string_lossy().into_owned();
        {
            let mut store = SqliteDetectionStore::open(&path)?;
            store.save_detection(&detection(ClassLabel::Mouse, 0.4, epoch_now()), None, false)?;
        }
        let mut store = SqliteDetectionStore::open(&path)?;
        assert_eq!(store.get_recent_detections(1)?.len(), 1);
        Ok(())
    }
}
