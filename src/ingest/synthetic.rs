//! Synthetic frame source for `stub://` addresses.
//!
//! `stub://<name>[?width=W&height=H][&fail=open|frame][&delay_ms=N]` produces a
//! moving gradient of the requested size (default 640x480). `fail=open` makes
//! every open fail and `fail=frame` makes every read fail. `delay_ms` stalls
//! each read, standing in for a slow camera.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{FrameSource, SourceHandle};
use crate::error::MonitorError;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MAX_SIDE: u32 = 8192;
const MAX_DELAY_MS: u64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FailMode {
    None,
    Open,
    Frame,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct StubAddress {
    name: String,
    width: u32,
    height: u32,
    fail: FailMode,
    delay: Duration,
}

fn parse_stub_address(address: &str) -> Result<StubAddress> {
    let rest = address
        .strip_prefix("stub://")
        .ok_or_else(|| anyhow!("not a stub:// address"))?;
    let (name, query) = rest.split_once('?').unwrap_or((rest, ""));
    let mut parsed = StubAddress {
        name: name.to_string(),
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
        fail: FailMode::None,
        delay: Duration::ZERO,
    };
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("malformed query parameter '{}'", pair))?;
        match key {
            "width" => parsed.width = parse_side(value)?,
            "height" => parsed.height = parse_side(value)?,
            "fail" => {
                parsed.fail = match value {
                    "open" => FailMode::Open,
                    "frame" => FailMode::Frame,
                    other => return Err(anyhow!("unknown fail mode '{}'", other)),
                }
            }
            "delay_ms" => {
                let ms: u64 = value
                    .parse()
                    .map_err(|_| anyhow!("'{}' is not a delay in milliseconds", value))?;
                if ms > MAX_DELAY_MS {
                    return Err(anyhow!("delay of {}ms exceeds {}ms", ms, MAX_DELAY_MS));
                }
                parsed.delay = Duration::from_millis(ms);
            }
            other => return Err(anyhow!("unknown stub parameter '{}'", other)),
        }
    }
    Ok(parsed)
}

fn parse_side(value: &str) -> Result<u32> {
    let side: u32 = value
        .parse()
        .map_err(|_| anyhow!("'{}' is not a frame dimension", value))?;
    if side == 0 || side > MAX_SIDE {
        return Err(anyhow!("frame dimension {} out of range", side));
    }
    Ok(side)
}

/// Synthetic source. Frames differ from one capture to the next.
#[derive(Default)]
pub struct SyntheticSource {
    frame_count: Arc<AtomicU64>,
}

impl SyntheticSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames produced so far, across all handles.
    pub fn frames_captured(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>> {
        let stub = parse_stub_address(address)
            .map_err(|e| MonitorError::source_unavailable(address, e))?;
        if stub.fail == FailMode::Open {
            return Err(MonitorError::source_unavailable(address, "simulated outage").into());
        }
        log::debug!("SyntheticSource: opened {}", stub.name);
        Ok(Box::new(SyntheticHandle {
            stub,
            frame_count: self.frame_count.clone(),
        }))
    }
}

struct SyntheticHandle {
    stub: StubAddress,
    frame_count: Arc<AtomicU64>,
}

impl SourceHandle for SyntheticHandle {
    fn capture_frame(&mut self) -> Result<Frame> {
        if !self.stub.delay.is_zero() {
            std::thread::sleep(self.stub.delay);
        }
        if self.stub.fail == FailMode::Frame {
            return Err(MonitorError::no_frame(&self.stub.name, "simulated decode failure").into());
        }
        let n = self.frame_count.fetch_add(1, Ordering::SeqCst) + 1;
        let shift = (n % 256) as u32;
        let image = RgbImage::from_fn(self.stub.width, self.stub.height, |x, y| {
            Rgb([
                ((x + shift) % 256) as u8,
                ((y + shift) % 256) as u8,
                (shift % 256) as u8,
            ])
        });
        Ok(Frame::new(image))
    }
}
