//! Frame acquisition.
//!
//! A capture opens the source, reads one usable frame and releases the
//! connection again; nothing is kept warm between cycles. Sources are picked
//! by address scheme:
//! - `stub://...` synthetic frames (tests, demos)
//! - `http(s)://...` JPEG snapshots or MJPEG (feature: ingest-http)
//! - everything else (RTSP, files, devices) through FFmpeg (feature: ingest-ffmpeg)
//!
//! Opening fails with `SourceUnavailable`; reading fails with
//! `NoFrameAvailable`. Both are bounded by `SourceTimeouts`.

#[cfg(feature = "ingest-ffmpeg")]
pub mod ffmpeg;
#[cfg(feature = "ingest-http")]
pub mod http;
pub mod synthetic;

use anyhow::Result;
use std::time::Duration;

use crate::error::MonitorError;
use crate::frame::Frame;

#[cfg(feature = "ingest-ffmpeg")]
pub use ffmpeg::FfmpegSource;
#[cfg(feature = "ingest-http")]
pub use http::HttpSource;
pub use synthetic::SyntheticSource;

/// Upper bounds on how long a single capture may block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceTimeouts {
    pub open: Duration,
    pub read: Duration,
}

impl Default for SourceTimeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(10),
            read: Duration::from_secs(10),
        }
    }
}

/// Opens video sources.
pub trait FrameSource: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Connect to `address`. Fails with `SourceUnavailable`.
    fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>>;
}

/// An open connection. Dropping it releases the connection.
pub trait SourceHandle: Send {
    /// Read one usable frame. Fails with `NoFrameAvailable`.
    fn capture_frame(&mut self) -> Result<Frame>;
}

/// Open, read one frame, release.
pub fn grab_frame(source: &dyn FrameSource, address: &str) -> Result<Frame> {
    let mut handle = source.open(address)?;
    let frame = handle.capture_frame();
    drop(handle);
    frame
}

/// Scheme-dispatching source used by the daemon.
pub struct SourceRouter {
    synthetic: SyntheticSource,
    #[cfg(feature = "ingest-http")]
    http: HttpSource,
    #[cfg(feature = "ingest-ffmpeg")]
    ffmpeg: FfmpegSource,
}

impl SourceRouter {
    pub fn new(timeouts: SourceTimeouts) -> Self {
        #[cfg(not(any(feature = "ingest-http", feature = "ingest-ffmpeg")))]
        let _ = timeouts;
        Self {
            synthetic: SyntheticSource::new(),
            #[cfg(feature = "ingest-http")]
            http: HttpSource::new(timeouts),
            #[cfg(feature = "ingest-ffmpeg")]
            ffmpeg: FfmpegSource::new(timeouts),
        }
    }

    fn backend_for(&self, address: &str) -> Result<&dyn FrameSource> {
        let scheme = address
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase());
        match scheme.as_deref() {
            Some("stub") => Ok(&self.synthetic),
            #[cfg(feature = "ingest-http")]
            Some("http") | Some("https") => Ok(&self.http),
            #[cfg(not(feature = "ingest-http"))]
            Some("http") | Some("https") => Err(MonitorError::source_unavailable(
                address,
                "http sources require the ingest-http feature",
            )
            .into()),
            #[cfg(feature = "ingest-ffmpeg")]
            _ => Ok(&self.ffmpeg),
            #[cfg(not(feature = "ingest-ffmpeg"))]
            _ => Err(MonitorError::source_unavailable(
                address,
                "this source type requires the ingest-ffmpeg feature",
            )
            .into()),
        }
    }
}

impl FrameSource for SourceRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>> {
        if address.trim().is_empty() {
            return Err(MonitorError::source_unavailable(address, "empty address").into());
        }
        self.backend_for(address)?.open(address)
    }
}
