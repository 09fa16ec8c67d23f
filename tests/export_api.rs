use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use lpx::api::{ApiConfig, ApiServer};
use lpx::export::decode_export;
use lpx::{FrameMeta, Store};

const BASE: i64 = 1_529_488_204_473_095;

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

fn request(addr: SocketAddr, method: &str, path: &str) -> Response {
    let mut stream = TcpStream::connect(addr).expect("connect api");
    let request = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes()).expect("send request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let headers = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = headers
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status code");
    Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    }
}

fn dechunk(mut body: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let line_end = body.windows(2).position(|w| w == b"\r\n").expect("chunk size line");
        let size = usize::from_str_radix(std::str::from_utf8(&body[..line_end]).unwrap(), 16)
            .expect("hex chunk size");
        body = &body[line_end + 2..];
        if size == 0 {
            assert_eq!(body, b"\r\n");
            return out;
        }
        out.extend_from_slice(&body[..size]);
        assert_eq!(&body[size..size + 2], b"\r\n");
        body = &body[size + 2..];
    }
}

fn seeded_store(dir: &std::path::Path) -> Arc<Store> {
    let store = Store::open(dir).unwrap();
    for (session_id, shift) in [("100", 0), ("200", 100_000)] {
        store.prepare(session_id).unwrap();
        let mut index = Vec::new();
        for ordinal in 0..4usize {
            let data = vec![ordinal as u8; 300 + ordinal];
            store.store_frame(session_id, ordinal, &data).unwrap();
            let start = BASE + shift + ordinal as i64 * 1000;
            index.push(FrameMeta::new(start, start + 1000));
        }
        store.write_index(session_id, &index).unwrap();
    }
    Arc::new(store)
}

fn spawn(store: Arc<Store>) -> lpx::api::ApiHandle {
    ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            export_chunk_bytes: 256,
        },
        store,
    )
    .spawn()
    .expect("spawn api")
}

#[test]
fn streams_whole_session_in_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path());
    let handle = spawn(store.clone());

    let response = request(handle.addr, "GET", "/stream?session=100");
    assert_eq!(response.status, 200);
    assert!(response.headers.contains("Transfer-Encoding: chunked"));
    assert!(response.headers.contains("application/octet-stream"));
    let frames = decode_export(&dechunk(&response.body)).unwrap();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[3].content, store.read_frame("100", 3).unwrap());

    let response = request(handle.addr, "GET", "/stream?session=100&offset=3");
    let frames = decode_export(&dechunk(&response.body)).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].name, "3.jpeg");

    let response = request(handle.addr, "GET", "/stream?session=100&frames=0,2100");
    let frames = decode_export(&dechunk(&response.body)).unwrap();
    let names: Vec<_> = frames.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["0.jpeg", "2.jpeg"]);

    let response = request(handle.addr, "GET", "/stream?session=100&frames=0%2C2100");
    assert_eq!(response.status, 200);
    assert_eq!(decode_export(&dechunk(&response.body)).unwrap().len(), 2);

    handle.stop().unwrap();
}

#[test]
fn stream_by_time_resolves_session() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn(seeded_store(dir.path()));

    let path = format!("/stream?time={}", BASE + 101_500);
    let response = request(handle.addr, "GET", &path);
    assert_eq!(response.status, 200);
    assert_eq!(decode_export(&dechunk(&response.body)).unwrap().len(), 4);

    let path = format!("/sessions/lookup?time={}", BASE + 2500);
    let response = request(handle.addr, "GET", &path);
    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["session_id"], "100");

    let path = format!("/stream?time={}", BASE + 50_000);
    assert_eq!(request(handle.addr, "GET", &path).status, 404);

    handle.stop().unwrap();
}

#[test]
fn errors_map_to_status_codes() {
    let dir = tempfile::tempdir().unwrap();
    let handle = spawn(seeded_store(dir.path()));

    let missing = request(handle.addr, "GET", "/stream?session=999");
    assert_eq!(missing.status, 404);
    assert_eq!(missing.body, br#"{"error":"not_found"}"#);

    assert_eq!(request(handle.addr, "GET", "/stream?session=../etc").status, 400);
    assert_eq!(request(handle.addr, "GET", "/stream").status, 400);
    assert_eq!(request(handle.addr, "GET", "/stream?session=100&offset=x").status, 400);
    assert_eq!(
        request(handle.addr, "GET", "/stream?session=100&offset=1&frames=0").status,
        400
    );
    assert_eq!(request(handle.addr, "GET", "/stream?session=100&frames=99000").status, 404);
    assert_eq!(request(handle.addr, "POST", "/stream?session=100").status, 405);
    assert_eq!(request(handle.addr, "GET", "/nowhere").status, 404);

    handle.stop().unwrap();
}

#[test]
fn delete_and_clear_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path());
    let handle = spawn(store.clone());

    let listing = request(handle.addr, "GET", "/sessions");
    let body: serde_json::Value = serde_json::from_slice(&listing.body).unwrap();
    assert_eq!(body["sessions"], serde_json::json!(["100", "200"]));

    assert_eq!(request(handle.addr, "DELETE", "/sessions/100").status, 200);
    assert_eq!(request(handle.addr, "DELETE", "/sessions/100").status, 404);
    assert_eq!(store.list_sessions().unwrap(), vec!["200"]);

    assert_eq!(request(handle.addr, "DELETE", "/sessions").status, 200);
    assert!(store.list_sessions().unwrap().is_empty());

    handle.stop().unwrap();
}
