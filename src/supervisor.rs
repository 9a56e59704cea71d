//! Stream registry and worker supervision.
//!
//! The supervisor owns every `StreamConfig`, starts one worker per active
//! stream and stops it again on deactivation or removal. Registry changes are
//! serialized by a single mutex; workers never take it.

use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::classify::Classifier;
use crate::error::MonitorError;
use crate::events::{EventSink, LogEventSink};
use crate::ingest::FrameSource;
use crate::mirror::OccupancyMirror;
use crate::model::{demo_regions, RegionConfig, RegionSpec, StreamConfig, StreamRequest};
use crate::screenshot::ScreenshotSink;
use crate::store::OccupancyStore;
use crate::worker::{run_cycle, CaptureReport, CycleContext, LiveWorkers, StreamControl, StreamWorker};

pub const DEFAULT_CAPTURE_INTERVAL: Duration = Duration::from_secs(30);

/// Produces candidate stream ids.
pub type IdGenerator = Box<dyn Fn() -> String + Send + Sync>;

/// Eight lowercase hex characters.
pub fn random_stream_id() -> String {
    let bytes: [u8; 4] = rand::random();
    hex::encode(bytes)
}

struct StreamEntry {
    config: StreamConfig,
    control: StreamControl,
    worker: Option<JoinHandle<()>>,
}

pub struct SupervisorBuilder {
    store: Arc<dyn OccupancyStore>,
    source: Arc<dyn FrameSource>,
    classifier: Arc<dyn Classifier>,
    screenshots: Option<Arc<dyn ScreenshotSink>>,
    mirror: Option<Arc<dyn OccupancyMirror>>,
    events: Arc<dyn EventSink>,
    interval: Duration,
    default_regions: Vec<RegionSpec>,
    ids: IdGenerator,
}

impl SupervisorBuilder {
    pub fn screenshots(mut self, sink: Arc<dyn ScreenshotSink>) -> Self {
        self.screenshots = Some(sink);
        self
    }

    pub fn mirror(mut self, mirror: Arc<dyn OccupancyMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Regions given to streams added without their own layout.
    pub fn default_regions(mut self, regions: Vec<RegionSpec>) -> Self {
        self.default_regions = regions;
        self
    }

    pub fn id_generator(mut self, ids: impl Fn() -> String + Send + Sync + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    pub fn build(self) -> StreamSupervisor {
        StreamSupervisor {
            ctx: Arc::new(CycleContext {
                store: self.store,
                source: self.source,
                classifier: self.classifier,
                screenshots: self.screenshots,
                mirror: self.mirror,
                events: self.events,
            }),
            interval: self.interval,
            default_regions: self.default_regions,
            ids: self.ids,
            registry: Mutex::new(BTreeMap::new()),
            stopped: Mutex::new(Vec::new()),
            live: LiveWorkers::new(),
        }
    }
}

pub struct StreamSupervisor {
    ctx: Arc<CycleContext>,
    interval: Duration,
    default_regions: Vec<RegionSpec>,
    ids: IdGenerator,
    registry: Mutex<BTreeMap<String, StreamEntry>>,
    /// Workers of removed or deactivated streams that may still be running.
    stopped: Mutex<Vec<JoinHandle<()>>>,
    live: LiveWorkers,
}

impl StreamSupervisor {
    pub fn builder(
        store: Arc<dyn OccupancyStore>,
        source: Arc<dyn FrameSource>,
        classifier: Arc<dyn Classifier>,
    ) -> SupervisorBuilder {
        SupervisorBuilder {
            store,
            source,
            classifier,
            screenshots: None,
            mirror: None,
            events: Arc::new(LogEventSink),
            interval: DEFAULT_CAPTURE_INTERVAL,
            default_regions: demo_regions(),
            ids: Box::new(random_stream_id),
        }
    }

    fn registry(&self) -> Result<MutexGuard<'_, BTreeMap<String, StreamEntry>>> {
        self.registry
            .lock()
            .map_err(|_| anyhow!("stream registry lock poisoned"))
    }

    /// Keep a cancelled worker's handle until it exits. Workers that already
    /// finished are joined here so the parked set stays small under churn.
    fn park(&self, handle: Option<JoinHandle<()>>) {
        let Ok(mut stopped) = self.stopped.lock() else {
            return;
        };
        let (finished, running): (Vec<_>, Vec<_>) =
            stopped.drain(..).partition(|handle| handle.is_finished());
        *stopped = running;
        for handle in finished {
            if handle.join().is_err() {
                log::error!("stream worker thread panicked outside its cycle");
            }
        }
        stopped.extend(handle);
    }

    fn mirror_save(&self, config: &StreamConfig) {
        if let Some(mirror) = &self.ctx.mirror {
            if let Err(e) = mirror.save_stream(config) {
                log::warn!("mirror: failed to save stream {}: {:#}", config.id, e);
            }
        }
    }

    /// Insert `config` and start its worker when active.
    fn register(&self, config: StreamConfig) -> Result<()> {
        config.validate()?;
        let mut registry = self.registry()?;
        if registry.contains_key(&config.id) {
            return Err(MonitorError::duplicate_stream(&config.id).into());
        }

        let control = StreamControl::new();
        let worker = if config.active {
            Some(
                StreamWorker::new(
                    self.ctx.clone(),
                    config.clone(),
                    control.clone(),
                    self.interval,
                    self.live.clone(),
                )
                .spawn()?,
            )
        } else {
            None
        };
        registry.insert(
            config.id.clone(),
            StreamEntry {
                config,
                control,
                worker,
            },
        );
        Ok(())
    }

    /// Register a new stream and start monitoring it. Returns the new id.
    pub fn add_stream(&self, request: StreamRequest) -> Result<String> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(MonitorError::invalid_config("stream url is required").into());
        }
        let regions = request
            .regions
            .unwrap_or_else(|| self.default_regions.clone())
            .into_iter()
            .map(RegionConfig::from_spec)
            .collect::<Result<Vec<_>>>()?;

        let id = (self.ids)();
        let name = request
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("Stream {}", id));
        let config = StreamConfig {
            id: id.clone(),
            url,
            name,
            active: true,
            regions,
            created_at: Utc::now(),
        };

        self.register(config.clone())?;
        self.mirror_save(&config);
        log::info!(
            "stream {} added: url={} regions={}",
            id,
            config.url,
            config.regions.len()
        );
        Ok(id)
    }

    /// Add a stream from static configuration unless one for the same url is
    /// already registered, typically restored from the mirror. Returns the id
    /// of the stream monitoring that url.
    pub fn ensure_stream(&self, request: StreamRequest) -> Result<String> {
        let url = request.url.trim().to_string();
        let existing = self
            .registry()?
            .values()
            .find(|entry| entry.config.url == url)
            .map(|entry| entry.config.id.clone());
        match existing {
            Some(id) => {
                log::info!("stream {} already monitors {}, not adding again", id, url);
                Ok(id)
            }
            None => self.add_stream(request),
        }
    }

    /// Re-register a previously persisted stream under its own id.
    pub fn restore_stream(&self, config: StreamConfig) -> Result<()> {
        let id = config.id.clone();
        self.register(config)?;
        log::info!("stream {} restored", id);
        Ok(())
    }

    /// Stop a stream's worker but keep its config and last results.
    pub fn deactivate_stream(&self, id: &str) -> Result<StreamConfig> {
        let mut registry = self.registry()?;
        let entry = registry
            .get_mut(id)
            .ok_or_else(|| MonitorError::stream_not_found(id))?;
        entry.config.active = false;
        entry.control.cancel.cancel();
        let config = entry.config.clone();
        self.park(entry.worker.take());
        drop(registry);

        self.mirror_save(&config);
        log::info!("stream {} deactivated", id);
        Ok(config)
    }

    /// Stop a stream and forget it, including its occupancy entries.
    pub fn remove_stream(&self, id: &str) -> Result<StreamConfig> {
        let mut registry = self.registry()?;
        let mut entry = registry
            .remove(id)
            .ok_or_else(|| MonitorError::stream_not_found(id))?;
        entry.control.retire();
        let dropped = self.ctx.store.remove_stream(id)?;
        self.park(entry.worker.take());
        drop(registry);

        if let Some(mirror) = &self.ctx.mirror {
            if let Err(e) = mirror.delete_stream(id) {
                log::warn!("mirror: failed to delete stream {}: {:#}", id, e);
            }
        }
        log::info!("stream {} removed ({} occupancy entries dropped)", id, dropped);
        entry.config.active = false;
        Ok(entry.config)
    }

    pub fn list_streams(&self) -> Result<Vec<StreamConfig>> {
        Ok(self
            .registry()?
            .values()
            .map(|entry| entry.config.clone())
            .collect())
    }

    pub fn get_stream(&self, id: &str) -> Result<StreamConfig> {
        self.registry()?
            .get(id)
            .map(|entry| entry.config.clone())
            .ok_or_else(|| MonitorError::stream_not_found(id).into())
    }

    /// Run one cycle now, outside the schedule.
    pub fn manual_capture(&self, id: &str) -> Result<CaptureReport> {
        let (config, control) = {
            let registry = self.registry()?;
            let entry = registry
                .get(id)
                .ok_or_else(|| MonitorError::stream_not_found(id))?;
            (entry.config.clone(), entry.control.clone())
        };
        run_cycle(&self.ctx, &config, &control).map_err(|e| {
            log::warn!("stream {} manual capture failed: {:#}", id, e);
            e
        })
    }

    /// Ids of workers currently running their loop.
    pub fn live_workers(&self) -> Vec<String> {
        self.live.ids()
    }

    pub fn active_count(&self) -> usize {
        self.registry()
            .map(|registry| registry.values().filter(|e| e.config.active).count())
            .unwrap_or(0)
    }

    pub fn store(&self) -> Arc<dyn OccupancyStore> {
        self.ctx.store.clone()
    }

    pub fn mirror(&self) -> Option<Arc<dyn OccupancyMirror>> {
        self.ctx.mirror.clone()
    }

    pub fn classifier_name(&self) -> &'static str {
        self.ctx.classifier.name()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Cancel every worker and wait for all of them to exit.
    ///
    /// Registered configs stay in place; they are simply no longer monitored.
    pub fn shutdown(&self) {
        let mut handles = Vec::new();
        if let Ok(mut registry) = self.registry.lock() {
            for entry in registry.values_mut() {
                entry.control.cancel.cancel();
                handles.extend(entry.worker.take());
            }
        }
        if let Ok(mut stopped) = self.stopped.lock() {
            handles.append(&mut stopped);
        }
        let count = handles.len();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("stream worker thread panicked outside its cycle");
            }
        }
        log::info!("supervisor stopped {} worker(s)", count);
    }
}

impl Drop for StreamSupervisor {
    fn drop(&mut self) {
        if let Ok(registry) = self.registry.lock() {
            for entry in registry.values() {
                entry.control.cancel.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{ClassLabels, MockClassifier};
    use crate::error::ErrorKind;
    use crate::ingest::SyntheticSource;
    use crate::store::InMemoryOccupancyStore;

    fn supervisor() -> StreamSupervisor {
        StreamSupervisor::builder(
            Arc::new(InMemoryOccupancyStore::new()),
            Arc::new(SyntheticSource::new()),
            Arc::new(MockClassifier::seeded(ClassLabels::default(), 7)),
        )
        .interval(Duration::from_secs(3600))
        .build()
    }

    #[test]
    fn generated_ids_are_eight_hex_chars() {
        let id = random_stream_id();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn add_uses_default_regions_and_name() -> Result<()> {
        let sup = supervisor();
        let id = sup.add_stream(StreamRequest {
            url: "stub://hall".to_string(),
            ..StreamRequest::default()
        })?;
        let cfg = sup.get_stream(&id)?;
        assert_eq!(cfg.regions.len(), 6);
        assert_eq!(cfg.name, format!("Stream {}", id));
        assert!(cfg.active);
        sup.shutdown();
        Ok(())
    }

    #[test]
    fn add_rejects_missing_url_and_duplicate_regions() {
        let sup = supervisor();
        let err = sup.add_stream(StreamRequest::default()).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::InvalidStreamConfig));

        let region = RegionSpec {
            id: "r1".to_string(),
            ..RegionSpec::default()
        };
        let err = sup
            .add_stream(StreamRequest {
                url: "stub://hall".to_string(),
                name: None,
                regions: Some(vec![region.clone(), region]),
            })
            .unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::InvalidStreamConfig));
        assert!(sup.list_streams().unwrap().is_empty());
    }

    #[test]
    fn inactive_restored_stream_gets_no_worker() -> Result<()> {
        let sup = supervisor();
        sup.restore_stream(StreamConfig {
            id: "0badf00d".to_string(),
            url: "stub://hall".to_string(),
            name: "hall".to_string(),
            active: false,
            regions: Vec::new(),
            created_at: Utc::now(),
        })?;
        assert_eq!(sup.list_streams()?.len(), 1);
        assert!(sup.live_workers().is_empty());
        assert_eq!(sup.active_count(), 0);
        Ok(())
    }

    #[test]
    fn deactivated_stream_still_accepts_manual_capture() -> Result<()> {
        let sup = supervisor();
        let id = sup.add_stream(StreamRequest {
            url: "stub://hall".to_string(),
            ..StreamRequest::default()
        })?;
        let cfg = sup.deactivate_stream(&id)?;
        assert!(!cfg.active);
        let report = sup.manual_capture(&id)?;
        assert_eq!(report.seats.len(), 6);
        assert_eq!(sup.store().stream(&id)?.len(), 6);
        sup.shutdown();
        assert!(sup.live_workers().is_empty());
        Ok(())
    }

    #[test]
    fn parked_workers_are_reaped_under_churn() -> Result<()> {
        let sup = StreamSupervisor::builder(
            Arc::new(InMemoryOccupancyStore::new()),
            Arc::new(SyntheticSource::new()),
            Arc::new(MockClassifier::seeded(ClassLabels::default(), 7)),
        )
        .interval(Duration::from_millis(5))
        .build();
        let request = || StreamRequest {
            url: "stub://churn?width=16&height=16".to_string(),
            ..StreamRequest::default()
        };

        for _ in 0..50 {
            let id = sup.add_stream(request())?;
            sup.remove_stream(&id)?;
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let all_exited = || {
            sup.stopped
                .lock()
                .map(|stopped| stopped.iter().all(|h| h.is_finished()))
                .unwrap_or(false)
        };
        while !all_exited() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(all_exited());

        let id = sup.add_stream(request())?;
        sup.remove_stream(&id)?;
        assert!(sup.stopped.lock().unwrap().len() <= 1);
        assert!(sup.live_workers().len() <= 1);
        sup.shutdown();
        assert!(sup.stopped.lock().unwrap().is_empty());
        Ok(())
    }
}
