//! FFmpeg-backed frame source for RTSP streams, local files and devices.
//!
//! Demuxing skips packets until the first keyframe so the decoded image is
//! never a partial reconstruction from a mid-GOP start. Network I/O is bounded
//! by `rw_timeout`/`timeout` (microseconds) and a wall-clock read deadline.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::sync::Once;
use std::time::Instant;

use super::{FrameSource, SourceHandle, SourceTimeouts};
use crate::error::MonitorError;
use crate::frame::Frame;

/// Give up on a stream that yields this many video packets without a frame.
const MAX_VIDEO_PACKETS: usize = 900;

static FFMPEG_INIT: Once = Once::new();

pub struct FfmpegSource {
    timeouts: SourceTimeouts,
}

impl FfmpegSource {
    pub fn new(timeouts: SourceTimeouts) -> Self {
        FFMPEG_INIT.call_once(|| {
            if let Err(err) = ffmpeg::init() {
                log::error!("FfmpegSource: ffmpeg init failed: {}", err);
            }
        });
        Self { timeouts }
    }

    fn options(&self, address: &str) -> ffmpeg::Dictionary<'static> {
        let micros = |d: std::time::Duration| d.as_micros().min(i64::MAX as u128).to_string();
        let mut opts = ffmpeg::Dictionary::new();
        opts.set("rw_timeout", &micros(self.timeouts.read));
        if address.starts_with("rtsp://") || address.starts_with("rtsps://") {
            opts.set("rtsp_transport", "tcp");
            opts.set("timeout", &micros(self.timeouts.open));
        }
        opts
    }
}

impl FrameSource for FfmpegSource {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>> {
        let input = ffmpeg::format::input_with_dictionary(&address, self.options(address))
            .map_err(|e| MonitorError::source_unavailable(address, e))?;
        let (stream_index, decoder) = open_video_decoder(&input)
            .map_err(|e| MonitorError::source_unavailable(address, e))?;
        Ok(Box::new(FfmpegHandle {
            address: address.to_string(),
            input,
            stream_index,
            decoder,
            deadline: Instant::now() + self.timeouts.read,
        }))
    }
}

fn open_video_decoder(
    input: &ffmpeg::format::context::Input,
) -> Result<(usize, ffmpeg::codec::decoder::Video)> {
    let stream = input
        .streams()
        .best(ffmpeg::media::Type::Video)
        .ok_or_else(|| anyhow!("source has no video track"))?;
    let context = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
        .context("load video decoder parameters")?;
    let decoder = context
        .decoder()
        .video()
        .context("open ffmpeg video decoder")?;
    Ok((stream.index(), decoder))
}

struct FfmpegHandle {
    address: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    deadline: Instant,
}

impl FfmpegHandle {
    fn first_keyframe_image(&mut self) -> Result<Frame> {
        let mut decoded = ffmpeg::frame::Video::empty();
        let mut seen_key = false;
        let mut video_packets = 0usize;

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            video_packets += 1;
            if video_packets > MAX_VIDEO_PACKETS || Instant::now() > self.deadline {
                return Err(anyhow!(
                    "no decodable frame after {} video packets",
                    video_packets - 1
                ));
            }
            if !seen_key {
                if !packet.is_key() {
                    continue;
                }
                seen_key = true;
            }
            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return to_rgb_frame(&decoded);
            }
        }

        // Flush frames the decoder is still holding at end of stream.
        if seen_key {
            self.decoder.send_eof().context("flush ffmpeg decoder")?;
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return to_rgb_frame(&decoded);
            }
        }
        Err(anyhow!("stream ended without a decodable keyframe"))
    }
}

impl SourceHandle for FfmpegHandle {
    fn capture_frame(&mut self) -> Result<Frame> {
        self.first_keyframe_image()
            .map_err(|e| MonitorError::no_frame(&self.address, e).into())
    }
}

fn to_rgb_frame(decoded: &ffmpeg::frame::Video) -> Result<Frame> {
    let mut scaler = ffmpeg::software::scaling::Context::get(
        decoded.format(),
        decoded.width(),
        decoded.height(),
        ffmpeg::util::format::pixel::Pixel::RGB24,
        decoded.width(),
        decoded.height(),
        ffmpeg::software::scaling::flag::Flags::BILINEAR,
    )
    .context("create ffmpeg scaler")?;
    let mut rgb = ffmpeg::frame::Video::empty();
    scaler.run(decoded, &mut rgb).context("scale frame to RGB")?;

    let width = rgb.width();
    let height = rgb.height();
    let row_bytes = (width as usize) * 3;
    let stride = rgb.stride(0);
    let data = rgb.data(0);

    if stride == row_bytes {
        let len = row_bytes * height as usize;
        let pixels = data
            .get(..len)
            .context("ffmpeg frame is shorter than its dimensions")?;
        return Frame::from_rgb(pixels.to_vec(), width, height);
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Frame::from_rgb(pixels, width, height)
}
