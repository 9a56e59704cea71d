//! HTTP frame source.
//!
//! Handles cameras that expose either a single JPEG snapshot or an MJPEG
//! (`multipart/x-mixed-replace`) stream. For MJPEG the first complete JPEG in
//! the stream is returned; the connection is dropped right after.

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::Instant;

use url::Url;

use super::{FrameSource, SourceHandle, SourceTimeouts};
use crate::error::MonitorError;
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub struct HttpSource {
    agent: ureq::Agent,
    timeouts: SourceTimeouts,
}

impl HttpSource {
    pub fn new(timeouts: SourceTimeouts) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeouts.open)
            .timeout_read(timeouts.read)
            .build();
        Self { agent, timeouts }
    }
}

impl FrameSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn open(&self, address: &str) -> Result<Box<dyn SourceHandle>> {
        let url = Url::parse(address).map_err(|e| MonitorError::source_unavailable(address, e))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MonitorError::source_unavailable(
                address,
                format!("unsupported scheme '{}'", url.scheme()),
            )
            .into());
        }
        let response = self
            .agent
            .get(url.as_str())
            .call()
            .map_err(|e| MonitorError::source_unavailable(address, e))?;
        let multipart = response
            .header("Content-Type")
            .unwrap_or("")
            .to_lowercase()
            .contains("multipart");
        Ok(Box::new(HttpHandle {
            address: address.to_string(),
            reader: response.into_reader(),
            multipart,
            deadline: Instant::now() + self.timeouts.read,
        }))
    }
}

struct HttpHandle {
    address: String,
    reader: Box<dyn Read + Send + Sync + 'static>,
    multipart: bool,
    deadline: Instant,
}

impl HttpHandle {
    fn read_body(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        (&mut self.reader)
            .take(MAX_JPEG_BYTES as u64 + 1)
            .read_to_end(&mut bytes)
            .context("read jpeg snapshot")?;
        if bytes.is_empty() {
            return Err(anyhow!("empty jpeg snapshot"));
        }
        if bytes.len() > MAX_JPEG_BYTES {
            return Err(anyhow!("jpeg snapshot exceeds {} bytes", MAX_JPEG_BYTES));
        }
        Ok(bytes)
    }

    fn read_first_mjpeg_part(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::with_capacity(64 * 1024);
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&buffer) {
                return Ok(buffer[start..end].to_vec());
            }
            if Instant::now() > self.deadline {
                return Err(anyhow!("no complete jpeg before read deadline"));
            }
            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                return Err(anyhow!("mjpeg stream ended"));
            }
            buffer.extend_from_slice(&chunk[..read]);
            if buffer.len() > MAX_JPEG_BYTES * 2 {
                return Err(anyhow!("mjpeg part exceeds {} bytes", MAX_JPEG_BYTES));
            }
        }
    }
}

impl SourceHandle for HttpHandle {
    fn capture_frame(&mut self) -> Result<Frame> {
        let bytes = if self.multipart {
            self.read_first_mjpeg_part()
        } else {
            self.read_body()
        }
        .map_err(|e| MonitorError::no_frame(&self.address, e))?;
        decode_jpeg(&bytes).map_err(|e| MonitorError::no_frame(&self.address, e).into())
    }
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame> {
    let image = image::load_from_memory(bytes).context("decode jpeg")?;
    Ok(Frame::new(image.into_rgb8()))
}

/// Byte range of the first complete JPEG (SOI..EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::ingest::grab_frame;
    use std::io::Write;
    use std::net::TcpListener;
    use std::time::Duration;

    fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10]));
        let mut out = std::io::Cursor::new(Vec::new());
        image
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .expect("encode jpeg");
        out.into_inner()
    }

    fn serve_once(content_type: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut buf = [0u8; 1024];
                let _ = std::io::Read::read(&mut stream, &mut buf);
                let header = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                    content_type,
                    body.len()
                );
                let _ = stream.write_all(header.as_bytes());
                let _ = stream.write_all(&body);
            }
        });
        format!("http://{}/snapshot.jpg", addr)
    }

    fn timeouts() -> SourceTimeouts {
        SourceTimeouts {
            open: Duration::from_secs(2),
            read: Duration::from_secs(2),
        }
    }

    #[test]
    fn finds_first_jpeg_in_buffer() {
        let buffer = [0x00, 0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9, 0xFF, 0xD8];
        assert_eq!(find_jpeg_bounds(&buffer), Some((1, 7)));
        assert_eq!(find_jpeg_bounds(&[0xFF, 0xD8, 0x00]), None);
    }

    #[test]
    fn fetches_single_jpeg_snapshot() -> Result<()> {
        let url = serve_once("image/jpeg", jpeg_bytes(16, 8));
        let frame = grab_frame(&HttpSource::new(timeouts()), &url)?;
        assert_eq!((frame.width(), frame.height()), (16, 8));
        Ok(())
    }

    #[test]
    fn takes_first_part_of_mjpeg_stream() -> Result<()> {
        let mut body = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        body.extend(jpeg_bytes(12, 6));
        body.extend(b"\r\n--frame\r\nContent-Type: image/jpeg\r\n\r\n");
        body.extend(jpeg_bytes(30, 30));
        let url = serve_once("multipart/x-mixed-replace; boundary=frame", body);
        let frame = grab_frame(&HttpSource::new(timeouts()), &url)?;
        assert_eq!((frame.width(), frame.height()), (12, 6));
        Ok(())
    }

    #[test]
    fn garbage_body_is_no_frame() {
        let url = serve_once("image/jpeg", b"not a jpeg".to_vec());
        let err = grab_frame(&HttpSource::new(timeouts()), &url).unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::NoFrameAvailable));
    }

    #[test]
    fn refused_connection_is_source_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        let err = grab_frame(&HttpSource::new(timeouts()), &format!("http://{}/", addr))
            .unwrap_err();
        assert_eq!(MonitorError::kind_of(&err), Some(ErrorKind::SourceUnavailable));
    }
}
