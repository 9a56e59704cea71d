//! Per-stream capture workers and the occupancy cycle they run.
//!
//! A cycle is capture → screenshot → map → classify → publish. Workers run it
//! on a timer; manual captures run the very same function once. Publishing
//! happens under the stream's publish lock and only while the stream is still
//! registered, so nothing is written for a stream after its removal.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::classify::{Classifier, PredictionResult};
use crate::error::MonitorError;
use crate::events::{EventKind, EventSink, MonitorEvent};
use crate::ingest::{grab_frame, FrameSource};
use crate::mirror::OccupancyMirror;
use crate::model::{SeatOccupancy, StreamConfig};
use crate::region::map_regions;
use crate::screenshot::ScreenshotSink;
use crate::store::OccupancyStore;

/// Cancellation flag a sleeping worker can be woken from.
#[derive(Default)]
pub struct CancelSignal {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = match self.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *cancelled = true;
        self.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        match self.cancelled.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Sleep up to `timeout`. Returns `true` as soon as the signal is cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = match self.cancelled.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cancelled = match self.cond.wait_timeout(cancelled, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *cancelled
    }
}

/// Collaborators shared by every worker and by manual captures.
pub struct CycleContext {
    pub store: Arc<dyn OccupancyStore>,
    pub source: Arc<dyn FrameSource>,
    pub classifier: Arc<dyn Classifier>,
    pub screenshots: Option<Arc<dyn ScreenshotSink>>,
    pub mirror: Option<Arc<dyn OccupancyMirror>>,
    pub events: Arc<dyn EventSink>,
}

/// Per-stream state shared between the registry, the worker and manual
/// captures.
///
/// `cancel` stops the worker loop. `retired` is set once the stream has left
/// the registry; after that nothing may be published for it. Both are checked
/// under `publish`.
#[derive(Clone)]
pub struct StreamControl {
    pub cancel: Arc<CancelSignal>,
    pub publish: Arc<Mutex<()>>,
    retired: Arc<AtomicBool>,
}

impl StreamControl {
    pub fn new() -> Self {
        Self {
            cancel: Arc::new(CancelSignal::new()),
            publish: Arc::new(Mutex::new(())),
            retired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Stop the worker and refuse further publishes. Waits for an in-flight
    /// publish to finish first.
    pub fn retire(&self) {
        let _publish = match self.publish.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        self.retired.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

impl Default for StreamControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one published cycle.
#[derive(Clone, Debug, Serialize)]
pub struct CaptureReport {
    pub stream_id: String,
    pub captured_at: DateTime<Utc>,
    pub screenshot_path: Option<PathBuf>,
    pub seats: Vec<SeatOccupancy>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn classify(
    classifier: &dyn Classifier,
    region_id: &str,
    image: &image::RgbImage,
) -> Result<PredictionResult> {
    match catch_unwind(AssertUnwindSafe(|| classifier.predict(image))) {
        Ok(Ok(prediction)) => Ok(prediction),
        Ok(Err(e)) => Err(MonitorError::classifier(format!("region {}: {:#}", region_id, e)).into()),
        Err(payload) => Err(MonitorError::classifier(format!(
            "region {}: classifier panicked: {}",
            region_id,
            panic_message(payload.as_ref())
        ))
        .into()),
    }
}

/// Run one occupancy cycle for `stream`.
///
/// The store is written only when every region classified successfully; any
/// failure leaves the previous results in place. Fails with `StreamNotFound`
/// when the stream was removed before its results could be published.
pub fn run_cycle(
    ctx: &CycleContext,
    stream: &StreamConfig,
    control: &StreamControl,
) -> Result<CaptureReport> {
    let frame = grab_frame(ctx.source.as_ref(), &stream.url)?;

    let screenshot_path = match &ctx.screenshots {
        Some(sink) => match sink.save(&stream.id, &frame) {
            Ok(path) => Some(path),
            Err(e) => {
                ctx.events.record(MonitorEvent::new(
                    &stream.id,
                    frame.captured_at,
                    EventKind::ScreenshotFailed,
                    format!("{:#}", e),
                ));
                None
            }
        },
        None => None,
    };

    let mut seats = Vec::with_capacity(stream.regions.len());
    for mapped in map_regions(&frame, &stream.regions) {
        let prediction = classify(ctx.classifier.as_ref(), &mapped.region.id, &mapped.image)?;
        seats.push(SeatOccupancy::new(mapped.region, prediction, frame.captured_at));
    }

    {
        let _publish = control
            .publish
            .lock()
            .map_err(|_| anyhow!("publish lock poisoned for stream {}", stream.id))?;
        if control.is_retired() {
            return Err(MonitorError::stream_not_found(&stream.id).into());
        }
        ctx.store.put_all(&stream.id, seats.clone())?;

        if let Some(mirror) = &ctx.mirror {
            if let Err(e) = mirror.record_cycle(
                &stream.id,
                frame.captured_at,
                &seats,
                screenshot_path.as_deref(),
            ) {
                ctx.events.record(MonitorEvent::new(
                    &stream.id,
                    frame.captured_at,
                    EventKind::MirrorFailed,
                    format!("{:#}", e),
                ));
            }
        }
    }

    ctx.events.record(MonitorEvent::new(
        &stream.id,
        frame.captured_at,
        EventKind::CycleCompleted {
            regions: seats.len(),
        },
        screenshot_path
            .as_ref()
            .map(|p| format!("screenshot={}", p.display()))
            .unwrap_or_default(),
    ));

    Ok(CaptureReport {
        stream_id: stream.id.clone(),
        captured_at: frame.captured_at,
        screenshot_path,
        seats,
    })
}

/// Ids of workers whose loop is running.
///
/// Counted per id so a worker still winding down cannot unregister a newer
/// worker for the same id.
#[derive(Clone, Default)]
pub struct LiveWorkers {
    inner: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl LiveWorkers {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self, id: &str) {
        if let Ok(mut live) = self.inner.lock() {
            *live.entry(id.to_string()).or_insert(0) += 1;
        }
    }

    fn leave(&self, id: &str) {
        if let Ok(mut live) = self.inner.lock() {
            if let Some(count) = live.get_mut(id) {
                *count -= 1;
                if *count == 0 {
                    live.remove(id);
                }
            }
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|live| live.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner
            .lock()
            .map(|live| live.contains_key(id))
            .unwrap_or(false)
    }
}

/// Periodic capture loop for one stream.
pub struct StreamWorker {
    ctx: Arc<CycleContext>,
    config: StreamConfig,
    control: StreamControl,
    interval: Duration,
    live: LiveWorkers,
}

impl StreamWorker {
    pub fn new(
        ctx: Arc<CycleContext>,
        config: StreamConfig,
        control: StreamControl,
        interval: Duration,
        live: LiveWorkers,
    ) -> Self {
        Self {
            ctx,
            config,
            control,
            interval,
            live,
        }
    }

    /// Register in the live set and start the loop on its own thread.
    pub fn spawn(self) -> Result<JoinHandle<()>> {
        let id = self.config.id.clone();
        self.live.enter(&id);
        let live = self.live.clone();
        thread::Builder::new()
            .name(format!("stream-{}", id))
            .spawn(move || self.run())
            .map_err(|e| {
                live.leave(&id);
                anyhow!("spawn worker for stream {}: {}", id, e)
            })
    }

    fn emit(&self, kind: EventKind, detail: impl Into<String>) {
        self.ctx
            .events
            .record(MonitorEvent::new(&self.config.id, Utc::now(), kind, detail));
    }

    fn run(self) {
        self.emit(
            EventKind::WorkerStarted,
            format!(
                "url={} regions={} interval={}s",
                self.config.url,
                self.config.regions.len(),
                self.interval.as_secs_f64()
            ),
        );

        loop {
            if self.control.cancel.is_cancelled() {
                break;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| {
                run_cycle(&self.ctx, &self.config, &self.control)
            }));
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(_)) if self.control.cancel.is_cancelled() => break,
                Ok(Err(e)) => self.emit(
                    EventKind::CycleFailed(MonitorError::kind_of(&e)),
                    format!("{:#}", e),
                ),
                Err(payload) => self.emit(
                    EventKind::CycleFailed(None),
                    format!("cycle panicked: {}", panic_message(payload.as_ref())),
                ),
            }

            if self.control.cancel.wait_timeout(self.interval) {
                break;
            }
        }

        self.live.leave(&self.config.id);
        self.emit(EventKind::WorkerStopped, "");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ClassLabels;
    use crate::error::ErrorKind;
    use crate::events::MemoryEventSink;
    use crate::frame::Frame;
    use crate::ingest::SourceHandle;
    use crate::model::{RegionConfig, RegionSpec};
    use crate::store::InMemoryOccupancyStore;
    use image::RgbImage;
    use std::sync::atomic::AtomicUsize;

    struct FixedSource {
        fail: bool,
    }

    struct FixedHandle;

    impl SourceHandle for FixedHandle {
        fn capture_frame(&mut self) -> Result<Frame> {
            Ok(Frame::new(RgbImage::new(64, 48)))
        }
    }

    impl FrameSource for FixedSource {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>> {
            if self.fail {
                return Err(MonitorError::source_unavailable(address, "offline").into());
            }
            Ok(Box::new(FixedHandle))
        }
    }

    /// Succeeds for the first `ok_calls` predictions, then fails or panics.
    struct ScriptedClassifier {
        ok_calls: usize,
        panic: bool,
        calls: AtomicUsize,
    }

    impl Classifier for ScriptedClassifier {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn predict(&self, _image: &RgbImage) -> Result<PredictionResult> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.ok_calls {
                return Ok(PredictionResult::from_output(2, 0.9, &ClassLabels::default()));
            }
            if self.panic {
                panic!("backend exploded");
            }
            Err(anyhow!("tensor shape mismatch"))
        }
    }

    fn context(
        fail_source: bool,
        ok_calls: usize,
        panic: bool,
    ) -> (CycleContext, Arc<InMemoryOccupancyStore>, Arc<MemoryEventSink>) {
        let store = Arc::new(InMemoryOccupancyStore::new());
        let events = Arc::new(MemoryEventSink::new());
        let ctx = CycleContext {
            store: store.clone(),
            source: Arc::new(FixedSource { fail: fail_source }),
            classifier: Arc::new(ScriptedClassifier {
                ok_calls,
                panic,
                calls: AtomicUsize::new(0),
            }),
            screenshots: None,
            mirror: None,
            events: events.clone(),
        };
        (ctx, store, events)
    }

    fn stream(region_ids: &[&str]) -> StreamConfig {
        StreamConfig {
            id: "deadbeef".to_string(),
            url: "fixed://cam".to_string(),
            name: "cam".to_string(),
            active: true,
            regions: region_ids
                .iter()
                .map(|id| {
                    RegionConfig::from_spec(RegionSpec {
                        id: id.to_string(),
                        ..RegionSpec::default()
                    })
                    .unwrap()
                })
                .collect(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn cancel_wakes_a_waiting_thread() {
        let signal = Arc::new(CancelSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let start = Instant::now();
                let cancelled = signal.wait_timeout(Duration::from_secs(30));
                (cancelled, start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        signal.cancel();
        let (cancelled, waited) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn wait_times_out_without_cancel() {
        let signal = CancelSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(20)));
        assert!(!signal.is_cancelled());
    }

    #[test]
    fn successful_cycle_publishes_every_region() -> Result<()> {
        let (ctx, store, events) = context(false, usize::MAX, false);
        let cfg = stream(&["a", "b", "c"]);
        let report = run_cycle(&ctx, &cfg, &StreamControl::new())?;
        assert_eq!(report.seats.len(), 3);
        let published = store.stream(&cfg.id)?;
        assert_eq!(published.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert_eq!(
            events.count(|e| matches!(e.kind, EventKind::CycleCompleted { regions: 3 })),
            1
        );
        Ok(())
    }

    #[test]
    fn capture_failure_leaves_store_untouched() {
        let (ctx, store, _) = context(true, usize::MAX, false);
        let err = run_cycle(&ctx, &stream(&["a"]), &StreamControl::new()).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::SourceUnavailable));
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn partial_classification_failure_publishes_nothing() {
        let (ctx, store, _) = context(false, 1, false);
        let err = run_cycle(&ctx, &stream(&["a", "b"]), &StreamControl::new()).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::ClassifierError));
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn classifier_panic_becomes_classifier_error() {
        let (ctx, _, _) = context(false, 0, true);
        let err = run_cycle(&ctx, &stream(&["a"]), &StreamControl::new()).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::ClassifierError));
        assert!(format!("{:#}", err).contains("backend exploded"));
    }

    #[test]
    fn retired_stream_is_not_published() {
        let (ctx, store, _) = context(false, usize::MAX, false);
        let control = StreamControl::new();
        control.retire();
        assert!(control.cancel.is_cancelled());
        let err = run_cycle(&ctx, &stream(&["a"]), &control).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::StreamNotFound));
        assert!(store.snapshot().unwrap().is_empty());
    }

    #[test]
    fn worker_reports_failures_and_stops_on_cancel() {
        let (ctx, _, events) = context(true, usize::MAX, false);
        let live = LiveWorkers::new();
        let control = StreamControl::new();
        let handle = StreamWorker::new(
            Arc::new(ctx),
            stream(&["a"]),
            control.clone(),
            Duration::from_millis(10),
            live.clone(),
        )
        .spawn()
        .unwrap();
        assert!(live.contains("deadbeef"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while events.count(MonitorEvent::is_failure) < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        control.cancel.cancel();
        handle.join().unwrap();

        assert!(live.ids().is_empty());
        let offline = EventKind::CycleFailed(Some(ErrorKind::SourceUnavailable));
        assert!(events.count(|e| e.kind == offline) >= 2);
        assert_eq!(events.count(|e| e.kind == EventKind::WorkerStopped), 1);
    }
}
