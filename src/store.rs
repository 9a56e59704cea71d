//! Occupancy store: stream id → region id → latest `SeatOccupancy`.
//!
//! One writer per stream (its worker, or a manual capture holding the same
//! publish lock), any number of readers. Readers may see some regions from
//! the current cycle and others from the previous one.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use crate::model::SeatOccupancy;

/// Per-stream view, ordered by region id.
pub type StreamOccupancy = BTreeMap<String, SeatOccupancy>;

pub trait OccupancyStore: Send + Sync {
    /// Insert or overwrite the entry for `(stream_id, entry.region_id)`.
    fn put(&self, stream_id: &str, entry: SeatOccupancy) -> Result<()>;

    /// Upsert a batch for one stream.
    fn put_all(&self, stream_id: &str, entries: Vec<SeatOccupancy>) -> Result<()> {
        for entry in entries {
            self.put(stream_id, entry)?;
        }
        Ok(())
    }

    fn get(&self, stream_id: &str, region_id: &str) -> Result<Option<SeatOccupancy>>;

    /// All live entries of one stream. Empty when the stream has none.
    fn stream(&self, stream_id: &str) -> Result<StreamOccupancy>;

    /// Drop every entry of a stream. Returns how many were removed.
    fn remove_stream(&self, stream_id: &str) -> Result<usize>;

    /// All streams that currently hold at least one live entry.
    fn snapshot(&self) -> Result<BTreeMap<String, StreamOccupancy>>;
}

/// `RwLock`-guarded in-memory store.
///
/// With a TTL configured, entries older than the TTL are hidden from reads and
/// dropped by [`InMemoryOccupancyStore::purge_expired`]. Without one, the last
/// good result of a failing stream is kept indefinitely.
#[derive(Default)]
pub struct InMemoryOccupancyStore {
    streams: RwLock<HashMap<String, HashMap<String, SeatOccupancy>>>,
    ttl: Option<Duration>,
}

impl InMemoryOccupancyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(ttl: Option<Duration>) -> Self {
        Self {
            streams: RwLock::default(),
            ttl,
        }
    }

    fn is_live(&self, entry: &SeatOccupancy) -> bool {
        let Some(ttl) = self.ttl else {
            return true;
        };
        let Ok(ttl) = chrono::Duration::from_std(ttl) else {
            return true;
        };
        Utc::now().signed_duration_since(entry.last_updated) <= ttl
    }

    fn live_entries(&self, regions: &HashMap<String, SeatOccupancy>) -> StreamOccupancy {
        regions
            .iter()
            .filter(|(_, entry)| self.is_live(entry))
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Remove expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> Result<usize> {
        if self.ttl.is_none() {
            return Ok(0);
        }
        let mut streams = self
            .streams
            .write()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        let mut dropped = 0;
        for regions in streams.values_mut() {
            let before = regions.len();
            regions.retain(|_, entry| self.is_live(entry));
            dropped += before - regions.len();
        }
        streams.retain(|_, regions| !regions.is_empty());
        Ok(dropped)
    }
}

impl OccupancyStore for InMemoryOccupancyStore {
    fn put(&self, stream_id: &str, entry: SeatOccupancy) -> Result<()> {
        self.put_all(stream_id, vec![entry])
    }

    fn put_all(&self, stream_id: &str, entries: Vec<SeatOccupancy>) -> Result<()> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        let regions = streams.entry(stream_id.to_string()).or_default();
        for entry in entries {
            regions.insert(entry.region_id.clone(), entry);
        }
        Ok(())
    }

    fn get(&self, stream_id: &str, region_id: &str) -> Result<Option<SeatOccupancy>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        Ok(streams
            .get(stream_id)
            .and_then(|regions| regions.get(region_id))
            .filter(|entry| self.is_live(entry))
            .cloned())
    }

    fn stream(&self, stream_id: &str) -> Result<StreamOccupancy> {
        let streams = self
            .streams
            .read()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        Ok(streams
            .get(stream_id)
            .map(|regions| self.live_entries(regions))
            .unwrap_or_default())
    }

    fn remove_stream(&self, stream_id: &str) -> Result<usize> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        Ok(streams.remove(stream_id).map(|r| r.len()).unwrap_or(0))
    }

    fn snapshot(&self) -> Result<BTreeMap<String, StreamOccupancy>> {
        let streams = self
            .streams
            .read()
            .map_err(|_| anyhow!("occupancy store lock poisoned"))?;
        Ok(streams
            .iter()
            .map(|(id, regions)| (id.clone(), self.live_entries(regions)))
            .filter(|(_, regions)| !regions.is_empty())
            .collect())
    }
}
