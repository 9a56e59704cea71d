//! Structured monitor events.
//!
//! Workers and the supervisor report lifecycle changes and contained failures
//! as `MonitorEvent`s. Where they go is up to the `EventSink`; the daemon
//! forwards them to the `log` facade.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;

use crate::error::ErrorKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum EventKind {
    WorkerStarted,
    WorkerStopped,
    CycleCompleted { regions: usize },
    /// A cycle was skipped; the store was left untouched. `None` when the
    /// failure was not a domain error (a panic, a poisoned lock).
    CycleFailed(#[serde(serialize_with = "serialize_kind")] Option<ErrorKind>),
    ScreenshotFailed,
    MirrorFailed,
}

fn serialize_kind<S: serde::Serializer>(kind: &Option<ErrorKind>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(kind.map(ErrorKind::code).unwrap_or("INTERNAL"))
}

#[derive(Clone, Debug, Serialize)]
pub struct MonitorEvent {
    pub stream_id: String,
    pub cycle_at: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

impl MonitorEvent {
    pub fn new(stream_id: &str, cycle_at: DateTime<Utc>, kind: EventKind, detail: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            cycle_at,
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self.kind,
            EventKind::CycleFailed(_) | EventKind::ScreenshotFailed | EventKind::MirrorFailed
        )
    }
}

pub trait EventSink: Send + Sync {
    fn record(&self, event: MonitorEvent);
}

/// Forwards events to the `log` facade.
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record(&self, event: MonitorEvent) {
        let cycle_at = event.cycle_at.format("%Y-%m-%dT%H:%M:%SZ");
        match event.kind {
            EventKind::WorkerStarted | EventKind::WorkerStopped => log::info!(
                "stream={} cycle_at={} event={:?} {}",
                event.stream_id,
                cycle_at,
                event.kind,
                event.detail
            ),
            EventKind::CycleCompleted { regions } => log::debug!(
                "stream={} cycle_at={} event=cycle_completed regions={} {}",
                event.stream_id,
                cycle_at,
                regions,
                event.detail
            ),
            EventKind::CycleFailed(kind) => log::warn!(
                "stream={} cycle_at={} event=cycle_failed kind={} {}",
                event.stream_id,
                cycle_at,
                kind.map(ErrorKind::code).unwrap_or("INTERNAL"),
                event.detail
            ),
            EventKind::ScreenshotFailed | EventKind::MirrorFailed => log::warn!(
                "stream={} cycle_at={} event={:?} {}",
                event.stream_id,
                cycle_at,
                event.kind,
                event.detail
            ),
        }
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<MonitorEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&MonitorEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| predicate(e)).count())
            .unwrap_or(0)
    }
}

impl EventSink for MemoryEventSink {
    fn record(&self, event: MonitorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
