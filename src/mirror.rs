//! Optional SQLite mirror of stream configs and occupancy.
//!
//! The in-memory store stays authoritative. The mirror keeps a copy so
//! streams survive restarts and clients can page through past cycles.
//! Callers treat every mirror error as non-fatal.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::model::{SeatOccupancy, StreamConfig};

/// One published cycle as recorded in the history table.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub stream_id: String,
    pub recorded_at: DateTime<Utc>,
    pub screenshot_path: Option<String>,
    pub seats: Vec<SeatOccupancy>,
}

pub trait OccupancyMirror: Send + Sync {
    fn save_stream(&self, config: &StreamConfig) -> Result<()>;

    /// Forget a stream's config and current occupancy. History is kept.
    fn delete_stream(&self, stream_id: &str) -> Result<()>;

    fn record_cycle(
        &self,
        stream_id: &str,
        recorded_at: DateTime<Utc>,
        seats: &[SeatOccupancy],
        screenshot_path: Option<&Path>,
    ) -> Result<()>;

    /// Persisted stream configs, oldest first.
    fn load_streams(&self) -> Result<Vec<StreamConfig>>;

    /// Most recent cycles first, optionally for one stream.
    fn history(&self, stream_id: Option<&str>, limit: usize) -> Result<Vec<HistoryRecord>>;
}

pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl SqliteMirror {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mirror = Self {
            conn: Mutex::new(conn),
        };
        mirror.ensure_schema()?;
        Ok(mirror)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("sqlite mirror lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS streams (
              id TEXT PRIMARY KEY,
              created_at TEXT NOT NULL,
              config_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS current_occupancy (
              stream_id TEXT PRIMARY KEY,
              recorded_at TEXT NOT NULL,
              screenshot_path TEXT,
              seats_json TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS occupancy_history (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              stream_id TEXT NOT NULL,
              recorded_at TEXT NOT NULL,
              screenshot_path TEXT,
              seats_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_stream ON occupancy_history(stream_id);
            "#,
        )?;
        Ok(())
    }
}

fn parse_time(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .map_err(|e| anyhow!("corrupt mirror timestamp '{}': {}", raw, e))?
        .with_timezone(&Utc))
}

impl OccupancyMirror for SqliteMirror {
    fn save_stream(&self, config: &StreamConfig) -> Result<()> {
        let config_json = serde_json::to_string(config)?;
        self.conn()?.execute(
            r#"
            INSERT INTO streams(id, created_at, config_json) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET config_json = excluded.config_json
            "#,
            params![config.id, config.created_at.to_rfc3339(), config_json],
        )?;
        Ok(())
    }

    fn delete_stream(&self, stream_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM streams WHERE id = ?1", params![stream_id])?;
        conn.execute(
            "DELETE FROM current_occupancy WHERE stream_id = ?1",
            params![stream_id],
        )?;
        Ok(())
    }

    fn record_cycle(
        &self,
        stream_id: &str,
        recorded_at: DateTime<Utc>,
        seats: &[SeatOccupancy],
        screenshot_path: Option<&Path>,
    ) -> Result<()> {
        let seats_json = serde_json::to_string(seats)?;
        let recorded_at = recorded_at.to_rfc3339();
        let screenshot = screenshot_path.map(|p| p.display().to_string());

        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO occupancy_history(stream_id, recorded_at, screenshot_path, seats_json)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![stream_id, recorded_at, screenshot, seats_json],
        )?;
        tx.execute(
            r#"
            INSERT INTO current_occupancy(stream_id, recorded_at, screenshot_path, seats_json)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(stream_id) DO UPDATE SET
              recorded_at = excluded.recorded_at,
              screenshot_path = excluded.screenshot_path,
              seats_json = excluded.seats_json
            "#,
            params![stream_id, recorded_at, screenshot, seats_json],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn load_streams(&self) -> Result<Vec<StreamConfig>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT config_json FROM streams ORDER BY created_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(serde_json::from_str(&row?)?);
        }
        Ok(out)
    }

    fn history(&self, stream_id: Option<&str>, limit: usize) -> Result<Vec<HistoryRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT stream_id, recorded_at, screenshot_path, seats_json
            FROM occupancy_history
            WHERE (?1 IS NULL OR stream_id = ?1)
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )?;
        let rows = stmt.query_map(params![stream_id, limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (stream_id, recorded_at, screenshot_path, seats_json) = row?;
            out.push(HistoryRecord {
                stream_id,
                recorded_at: parse_time(&recorded_at)?,
                screenshot_path,
                seats: serde_json::from_str(&seats_json)?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassLabels, PredictionResult};
    use crate::model::{demo_regions, RegionConfig};

    fn config(id: &str) -> StreamConfig {
        StreamConfig {
            id: id.to_string(),
            url: format!("stub://{}", id),
            name: id.to_string(),
            active: true,
            regions: demo_regions()
                .into_iter()
                .map(RegionConfig::from_spec)
                .collect::<Result<_>>()
                .unwrap(),
            created_at: Utc::now(),
        }
    }

    fn seats(cfg: &StreamConfig, class_index: usize) -> Vec<SeatOccupancy> {
        let labels = ClassLabels::default();
        cfg.regions
            .iter()
            .map(|r| {
                SeatOccupancy::new(
                    r,
                    PredictionResult::from_output(class_index, 0.8, &labels),
                    Utc::now(),
                )
            })
            .collect()
    }

    #[test]
    fn streams_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("mirror.db");
        let path = path.to_str().unwrap();
        let cfg = config("aabbccdd");
        {
            let mirror = SqliteMirror::open(path)?;
            mirror.save_stream(&cfg)?;
            mirror.save_stream(&config("11223344"))?;
            mirror.delete_stream("11223344")?;
        }
        let mirror = SqliteMirror::open(path)?;
        let restored = mirror.load_streams()?;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].id, cfg.id);
        assert_eq!(restored[0].regions, cfg.regions);
        Ok(())
    }

    #[test]
    fn history_is_newest_first_and_filtered() -> Result<()> {
        let mirror = SqliteMirror::open(":memory:")?;
        let a = config("a");
        let b = config("b");
        mirror.record_cycle("a", Utc::now(), &seats(&a, 0), None)?;
        mirror.record_cycle("b", Utc::now(), &seats(&b, 1), None)?;
        mirror.record_cycle("a", Utc::now(), &seats(&a, 2), Some(Path::new("shots/a.jpg")))?;

        let all = mirror.history(None, 10)?;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].stream_id, "a");
        assert_eq!(all[0].screenshot_path.as_deref(), Some("shots/a.jpg"));
        assert_eq!(all[0].seats[0].prediction.class_index, 2);

        let only_a = mirror.history(Some("a"), 10)?;
        assert_eq!(only_a.len(), 2);
        assert!(only_a.iter().all(|h| h.stream_id == "a"));

        assert_eq!(mirror.history(None, 1)?.len(), 1);
        Ok(())
    }
}
