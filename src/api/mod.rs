//! JSON HTTP surface over the supervisor and the occupancy store.
//!
//! A single accept loop on its own thread handles reads and registry changes
//! inline. Manual captures may block for a full source timeout, so each one
//! gets its own thread and never holds up pollers.

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{ErrorKind, MonitorError};
use crate::model::StreamRequest;
use crate::supervisor::StreamSupervisor;

const MAX_REQUEST_BYTES: usize = 256 * 1024;
const DEFAULT_HISTORY_LIMIT: usize = 100;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5001".to_string(),
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    supervisor: Arc<StreamSupervisor>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, supervisor: Arc<StreamSupervisor>) -> Self {
        Self { cfg, supervisor }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let supervisor = self.supervisor;
        let join = std::thread::Builder::new()
            .name("occupancy-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, supervisor, shutdown_thread) {
                    log::error!("occupancy api stopped: {}", err);
                }
            })?;
        log::info!("occupancy api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    supervisor: Arc<StreamSupervisor>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, &supervisor) {
                    log::warn!("occupancy api request failed: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, supervisor: &Arc<StreamSupervisor>) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(
                &mut stream,
                400,
                &json!({"error": "bad_request", "message": err.to_string()}),
            )?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.raw_path);

    if request.is_manual_capture() {
        let supervisor = supervisor.clone();
        std::thread::Builder::new()
            .name("manual-capture".to_string())
            .spawn(move || {
                if let Err(err) = respond(&mut stream, &request, &supervisor) {
                    log::warn!("occupancy api request failed: {}", err);
                }
            })?;
        return Ok(());
    }
    respond(&mut stream, &request, supervisor)
}

fn respond(
    stream: &mut TcpStream,
    request: &HttpRequest,
    supervisor: &StreamSupervisor,
) -> Result<()> {
    let (status, body) = match route(request, supervisor) {
        Ok(response) => response,
        Err(err) => error_response(&err),
    };
    write_json_response(stream, status, &body)
}

fn route(request: &HttpRequest, supervisor: &StreamSupervisor) -> Result<(u16, Value)> {
    match (request.method.as_str(), request.segments().as_slice()) {
        ("GET", []) => Ok((200, health(supervisor))),
        ("GET", ["streams"]) => {
            let streams = supervisor.list_streams()?;
            Ok((200, json!({"count": streams.len(), "streams": streams})))
        }
        ("POST", ["streams"]) => {
            let body: StreamRequest = serde_json::from_slice(&request.body).map_err(|e| {
                MonitorError::invalid_config(format!("invalid stream request: {}", e))
            })?;
            let id = supervisor.add_stream(body)?;
            let stream = supervisor.get_stream(&id)?;
            Ok((
                201,
                json!({"message": "stream added and processing started", "stream": stream}),
            ))
        }
        ("DELETE", ["streams", id]) => {
            supervisor.remove_stream(id)?;
            Ok((
                200,
                json!({"message": format!("stream {} stopped and removed", id)}),
            ))
        }
        ("POST", ["streams", id, "capture"]) => {
            let report = supervisor.manual_capture(id)?;
            Ok((200, to_value(&report)?))
        }
        ("POST", ["streams", id, "deactivate"]) => {
            let stream = supervisor.deactivate_stream(id)?;
            Ok((200, json!({"message": "stream deactivated", "stream": stream})))
        }
        ("GET", ["occupancy"]) => {
            let streams = supervisor.store().snapshot()?;
            Ok((
                200,
                json!({"timestamp": Utc::now(), "streams": streams}),
            ))
        }
        ("GET", ["occupancy", "history"]) => history(request, supervisor),
        ("GET", ["occupancy", id]) => {
            supervisor.get_stream(id)?;
            let seats = supervisor.store().stream(id)?;
            Ok((
                200,
                json!({"stream_id": id, "timestamp": Utc::now(), "seats": seats}),
            ))
        }
        (_, ["streams", ..]) | (_, ["occupancy", ..]) | (_, []) => {
            Ok((405, json!({"error": "method_not_allowed"})))
        }
        _ => Ok((404, json!({"error": "not_found"}))),
    }
}

fn health(supervisor: &StreamSupervisor) -> Value {
    json!({
        "status": "running",
        "classifier": supervisor.classifier_name(),
        "active_streams": supervisor.active_count(),
        "live_workers": supervisor.live_workers().len(),
        "mirror_available": supervisor.mirror().is_some(),
        "capture_interval_seconds": supervisor.interval().as_secs(),
    })
}

fn history(request: &HttpRequest, supervisor: &StreamSupervisor) -> Result<(u16, Value)> {
    let query = request.query();
    let limit = match query.get("limit") {
        Some(raw) => raw.parse::<usize>().map_err(|_| {
            MonitorError::invalid_config(format!("limit must be a non-negative integer, got '{}'", raw))
        })?,
        None => DEFAULT_HISTORY_LIMIT,
    };
    let Some(mirror) = supervisor.mirror() else {
        return Ok((
            200,
            json!({"error": "persistence not configured", "history": []}),
        ));
    };
    let stream_id = query.get("stream_id").map(String::as_str);
    let records = mirror.history(stream_id, limit)?;
    Ok((
        200,
        json!({"count": records.len(), "limit": limit, "history": records}),
    ))
}

fn status_for(kind: Option<ErrorKind>) -> u16 {
    match kind {
        Some(ErrorKind::InvalidStreamConfig) => 400,
        Some(ErrorKind::StreamNotFound) => 404,
        Some(ErrorKind::DuplicateStreamId) => 409,
        Some(ErrorKind::SourceUnavailable) | Some(ErrorKind::NoFrameAvailable) => 503,
        Some(ErrorKind::ClassifierError) | None => 500,
    }
}

fn error_response(err: &anyhow::Error) -> (u16, Value) {
    let kind = MonitorError::kind_of(err);
    let code = kind.map(ErrorKind::code).unwrap_or("INTERNAL");
    (
        status_for(kind),
        json!({"error": code, "message": format!("{:#}", err)}),
    )
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end.min(data.len())]).to_string();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.split_off(header_end.min(data.len()));
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("request body truncated"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        201 => "HTTP/1.1 201 Created",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    raw_path: String,
    body: Vec<u8>,
}

impl HttpRequest {
    fn segments(&self) -> Vec<&str> {
        self.path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect()
    }

    fn is_manual_capture(&self) -> bool {
        self.method == "POST" && matches!(self.segments().as_slice(), ["streams", _, "capture"])
    }

    /// Decoded query parameters; the last occurrence of a key wins.
    fn query(&self) -> HashMap<String, String> {
        match self.raw_path.split_once('?') {
            Some((_, query)) => url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .collect(),
            None => HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(raw_path: &str) -> HttpRequest {
        request_with("GET", raw_path)
    }

    fn request_with(method: &str, raw_path: &str) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            path: raw_path.split('?').next().unwrap().to_string(),
            raw_path: raw_path.to_string(),
            body: Vec::new(),
        }
    }

    #[test]
    fn query_pairs_are_split() {
        let q = request("/occupancy/history?stream_id=ab12cd34&limit=5").query();
        assert_eq!(q.get("stream_id").map(String::as_str), Some("ab12cd34"));
        assert_eq!(q.get("limit").map(String::as_str), Some("5"));
        assert!(request("/occupancy/history").query().is_empty());
    }

    #[test]
    fn query_values_are_percent_decoded() {
        let q = request("/occupancy/history?stream_id=front%20door&note=a+b%26c").query();
        assert_eq!(q.get("stream_id").map(String::as_str), Some("front door"));
        assert_eq!(q.get("note").map(String::as_str), Some("a b&c"));
    }

    #[test]
    fn only_post_capture_is_dispatched_off_thread() {
        assert!(request_with("POST", "/streams/ab12cd34/capture").is_manual_capture());
        assert!(!request_with("GET", "/streams/ab12cd34/capture").is_manual_capture());
        assert!(!request_with("POST", "/streams/ab12cd34/deactivate").is_manual_capture());
        assert!(!request_with("POST", "/streams").is_manual_capture());
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (MonitorError::invalid_config("x"), 400),
            (MonitorError::stream_not_found("x"), 404),
            (MonitorError::duplicate_stream("x"), 409),
            (MonitorError::source_unavailable("rtsp://x", "down"), 503),
            (MonitorError::no_frame("rtsp://x", "eof"), 503),
            (MonitorError::classifier("bad tensor"), 500),
        ];
        for (err, status) in cases {
            let (got, body) = error_response(&err.into());
            assert_eq!(got, status);
            assert!(body["error"].is_string());
        }
        assert_eq!(error_response(&anyhow!("disk full")).0, 500);
    }
}
