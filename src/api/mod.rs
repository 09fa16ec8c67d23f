//! HTTP export service.
//!
//! A small HTTP/1.1 server over `std::net`. Each connection is served on its
//! own thread and closed after one response. Export bodies are pulled from an
//! `ExportStream` chunk by chunk and written with chunked transfer encoding,
//! so memory per request stays at one chunk regardless of session size.
//!
//! Query values are percent-decoded. Error responses carry a generic JSON
//! body only; details go to the log.

use crate::error::Error;
use crate::export::{ExportRequest, ExportStream, ReadOutcome};
use crate::storage::Store;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Upper bound of one export read, and so of one body chunk.
    pub export_chunk_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8888".to_string(),
            export_chunk_bytes: 64 * 1024,
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
    store: Arc<Store>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, store: Arc<Store>) -> Self {
        Self { cfg, store }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg.clone();
        let store = self.store.clone();
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, cfg, store, shutdown_thread) {
                log::error!("export api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    store: Arc<Store>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let store = store.clone();
                let chunk_bytes = cfg.export_chunk_bytes;
                std::thread::spawn(move || {
                    if let Err(err) = handle_connection(stream, &store, chunk_bytes) {
                        log::warn!("export api request from {} failed: {:#}", peer, err);
                    }
                });
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

fn handle_connection(mut stream: TcpStream, store: &Store, chunk_bytes: usize) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    log::debug!("export api: {} {}", request.method, request.raw_path);

    let segments: Vec<&str> = request
        .path
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (request.method.as_str(), segments.as_slice()) {
        ("GET", ["health"]) => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#),
        ("GET", ["sessions"]) => match store.list_sessions() {
            Ok(sessions) => {
                let body = serde_json::json!({ "sessions": sessions }).to_string();
                write_json_response(&mut stream, 200, &body)
            }
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", ["sessions", "lookup"]) => match lookup_session(store, &request) {
            Ok(session_id) => {
                let body = serde_json::json!({ "session_id": session_id }).to_string();
                write_json_response(&mut stream, 200, &body)
            }
            Err(err) => write_error(&mut stream, &err),
        },
        ("GET", ["stream"]) => match open_export(store, &request) {
            Ok(mut export) => {
                let result = write_export_response(&mut stream, &mut export, chunk_bytes);
                export.close();
                result
            }
            Err(err) => write_error(&mut stream, &err),
        },
        ("DELETE", ["sessions"]) => match store.clear() {
            Ok(()) => write_json_response(&mut stream, 200, r#"{"status":"cleared"}"#),
            Err(err) => write_error(&mut stream, &err),
        },
        ("DELETE", ["sessions", session_id]) => match store.delete_session(session_id) {
            Ok(()) => write_json_response(&mut stream, 200, r#"{"status":"deleted"}"#),
            Err(err) => write_error(&mut stream, &err),
        },
        (_, ["health"] | ["sessions"] | ["sessions", "lookup"] | ["stream"]) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        (method, ["sessions", _]) if method != "GET" => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn lookup_session(store: &Store, request: &HttpRequest) -> Result<String, Error> {
    let time = request.query_i64("time")?.ok_or_else(|| missing("time"))?;
    store
        .find_session(time)?
        .ok_or_else(|| Error::NotFound(format!("no session at {time}")))
}

/// `/stream?session=ID[&offset=K|&frames=t1,t2]` or `/stream?time=T`.
fn open_export(store: &Store, request: &HttpRequest) -> Result<ExportStream, Error> {
    let session = request.query.get("session");
    let time = request.query_i64("time")?;
    let offset = request.query.get("offset");
    let frames = request.query.get("frames");

    let session_id = match (session, time) {
        (Some(_), Some(_)) => {
            return Err(Error::BadRequest("session and time are exclusive".to_string()))
        }
        (Some(session_id), None) => session_id.clone(),
        (None, Some(time)) => store
            .find_session(time)?
            .ok_or_else(|| Error::NotFound(format!("no session at {time}")))?,
        (None, None) => return Err(missing("session")),
    };

    let export_request = match (offset, frames) {
        (Some(_), Some(_)) => {
            return Err(Error::BadRequest("offset and frames are exclusive".to_string()))
        }
        (Some(offset), None) => ExportRequest::FromOffset(
            offset
                .parse()
                .map_err(|_| Error::BadRequest("offset must be a frame ordinal".to_string()))?,
        ),
        (None, Some(frames)) => ExportRequest::AtOffsets(parse_offsets(frames)?),
        (None, None) => ExportRequest::FromOffset(0),
    };
    store.open_export_request(&session_id, &export_request)
}

fn parse_offsets(value: &str) -> Result<Vec<i64>, Error> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            part.trim()
                .parse::<i64>()
                .map_err(|_| Error::BadRequest(format!("frame offset {part:?} is not an integer")))
        })
        .collect()
}

fn missing(name: &str) -> Error {
    Error::BadRequest(format!("{name} query parameter expected"))
}

fn write_export_response(
    stream: &mut TcpStream,
    export: &mut ExportStream,
    chunk_bytes: usize,
) -> Result<()> {
    let header = "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nTransfer-Encoding: chunked\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n";
    stream.write_all(header.as_bytes())?;

    let mut buf = vec![0u8; chunk_bytes];
    let mut sent = 0u64;
    loop {
        // Status is already on the wire; a failure here can only cut the
        // body short, which the client sees as a missing terminal chunk.
        match export.read_into(&mut buf)? {
            ReadOutcome::Bytes(0) => continue,
            ReadOutcome::Bytes(n) => {
                write!(stream, "{n:x}\r\n")?;
                stream.write_all(&buf[..n])?;
                stream.write_all(b"\r\n")?;
                sent += n as u64;
            }
            ReadOutcome::EndOfStream => break,
        }
    }
    stream.write_all(b"0\r\n\r\n")?;
    log::info!(
        "export api: streamed {} frames ({} bytes)",
        export.frame_count(),
        sent
    );
    Ok(())
}

fn status_for(err: &Error) -> (u16, &'static str) {
    match err {
        Error::NotFound(_) => (404, r#"{"error":"not_found"}"#),
        Error::AlreadyExists(_) | Error::BadRequest(_) => (400, r#"{"error":"bad_request"}"#),
        _ => (500, r#"{"error":"internal"}"#),
    }
}

fn write_error(stream: &mut TcpStream, err: &Error) -> Result<()> {
    let (status, body) = status_for(err);
    if status == 500 {
        log::error!("export api: {}", err);
    } else {
        log::info!("export api: {}", err);
    }
    write_json_response(stream, status, body)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
        raw_path: raw_path.to_string(),
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (!k.is_empty()).then(|| (percent_decode(k), percent_decode(v)))
        })
        .collect()
}

/// Decodes `%XX` escapes and `+`. Malformed escapes are kept literally.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let escaped = bytes
                    .get(i + 1..i + 3)
                    .and_then(|hex| std::str::from_utf8(hex).ok())
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok());
                match escaped {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
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
    query: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    fn query_i64(&self, name: &str) -> Result<Option<i64>, Error> {
        self.query
            .get(name)
            .map(|value| {
                value
                    .parse::<i64>()
                    .map_err(|_| Error::BadRequest(format!("{name} must be an integer")))
            })
            .transpose()
    }
}
