//! Multi-stream seat occupancy monitor.
//!
//! Periodically captures a frame from every configured video source, crops the
//! configured seat regions out of it, classifies each crop and publishes the
//! results to a store that clients poll.
//!
//! # Architecture
//!
//! One worker thread per active stream runs the cycle
//! capture → map → classify → publish. Workers share only the
//! [`store::OccupancyStore`] and the supervisor's registry; a slow or broken
//! source stalls nothing but its own worker.
//!
//! Failures inside a cycle never stop a worker. A failing stream keeps showing
//! its last good occupancy, and a region that was never classified has no
//! entry at all.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, HTTP/MJPEG, FFmpeg) behind `FrameSource`
//! - `region`: camera-box cropping with whole-frame fallback
//! - `classify`: `Classifier` trait, mock and ONNX backends
//! - `store`: concurrent stream → region → occupancy map
//! - `worker`, `supervisor`: cycle, worker lifecycle, stream registry
//! - `mirror`, `screenshot`, `events`: optional persistence and reporting
//! - `api`, `config`: HTTP surface and daemon configuration

pub mod api;
pub mod classify;
pub mod config;
pub mod error;
pub mod events;
pub mod frame;
pub mod ingest;
pub mod mirror;
pub mod model;
pub mod region;
pub mod screenshot;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use classify::{load_classifier, ClassLabels, Classifier, MockClassifier, PredictionResult};
pub use error::{ErrorKind, MonitorError};
pub use events::{EventKind, EventSink, LogEventSink, MemoryEventSink, MonitorEvent};
pub use frame::Frame;
pub use ingest::{grab_frame, FrameSource, SourceHandle, SourceRouter, SourceTimeouts, SyntheticSource};
pub use mirror::{HistoryRecord, OccupancyMirror, SqliteMirror};
pub use model::{
    demo_regions, CameraBox, FloorplanRect, RegionConfig, RegionSpec, SeatOccupancy, StreamConfig,
    StreamRequest,
};
pub use region::{map_regions, MappedRegion};
pub use screenshot::{DirectoryScreenshotSink, ScreenshotSink};
pub use store::{InMemoryOccupancyStore, OccupancyStore, StreamOccupancy};
pub use supervisor::{random_stream_id, StreamSupervisor, SupervisorBuilder};
pub use worker::{run_cycle, CancelSignal, CaptureReport, CycleContext, StreamControl};
