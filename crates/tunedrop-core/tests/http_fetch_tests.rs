//! `HttpFetcher` against a local HTTP/1.1 server.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tunedrop_core::sink::store_validator;
use tunedrop_core::{
    FetchConfig, FetchEvent, FetchRequest, Fetcher, HttpFetcher, ResumeValidator, Transfer,
    TransferContext, TransferStatus, UploadMethod, UploadRequest,
};

#[derive(Debug, Clone)]
struct Request {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(&'static str, String)>,
    body: Vec<u8>,
}

impl Response {
    fn new(status: u16, reason: &'static str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

type Handler = dyn Fn(&Request) -> Response + Send + Sync;

/// Serve `handler` on a random local port. Returns the base URL and the log
/// of requests received.
async fn serve(
    handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
) -> (String, Arc<Mutex<Vec<Request>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let log = Arc::new(Mutex::new(Vec::new()));
    let handler: Arc<Handler> = Arc::new(handler);

    let requests = Arc::clone(&log);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            let requests = Arc::clone(&requests);
            tokio::spawn(async move {
                handle_connection(stream, handler, requests).await;
            });
        }
    });

    (base, log)
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<Request>>>,
) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos;
        }
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let path = request_line.next().unwrap_or_default().to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body = buf[header_end + 4..].to_vec();
    let chunked = headers
        .get("transfer-encoding")
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    if chunked {
        while find(&body, b"0\r\n\r\n").is_none() {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
        body = decode_chunked(&body);
    } else if let Some(len) = headers.get("content-length").and_then(|v| v.parse().ok()) {
        while body.len() < len {
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => body.extend_from_slice(&chunk[..n]),
            }
        }
    }

    let request = Request {
        method,
        path,
        headers,
        body,
    };
    let response = handler(&request);
    requests.lock().unwrap().push(request);

    let mut out = format!("HTTP/1.1 {} {}\r\n", response.status, response.reason);
    for (name, value) in &response.headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    if !response
        .headers
        .iter()
        .any(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    {
        out.push_str(&format!("Content-Length: {}\r\n", response.body.len()));
    }
    out.push_str("Connection: close\r\n\r\n");

    let _ = stream.write_all(out.as_bytes()).await;
    let _ = stream.write_all(&response.body).await;
    let _ = stream.shutdown().await;
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(line_end) = find(raw, b"\r\n") {
        let size_str = String::from_utf8_lossy(&raw[..line_end]);
        let size = usize::from_str_radix(size_str.split(';').next().unwrap_or("0").trim(), 16)
            .unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        out.extend_from_slice(&raw[start..start + size]);
        raw = &raw[start + size + 2..];
    }
    out
}

fn fetcher() -> HttpFetcher {
    HttpFetcher::new(FetchConfig::default()).unwrap()
}

async fn collect(fetcher: &HttpFetcher, request: FetchRequest) -> (Vec<FetchEvent>, Vec<u8>) {
    let mut handle = fetcher.fetch(request);
    let mut events = Vec::new();
    let mut body = Vec::new();
    while let Some(event) = handle.next_event().await {
        match event {
            FetchEvent::Data(chunk) => body.extend_from_slice(&chunk),
            other => events.push(other),
        }
    }
    (events, body)
}

const CONTENT: &[u8] = b"0123456789abcdefghij";

/// Serves `CONTENT` with an entity tag and honours ranges when `If-Range`
/// matches.
fn media_handler(request: &Request) -> Response {
    if request.path == "/moved" {
        return Response::new(302, "Found").header("Location", "/media");
    }
    if request.path != "/media" {
        return Response::new(404, "Not Found");
    }

    let if_range_ok = request.header("if-range").is_none_or(|v| v == "\"v1\"");
    match request.header("range").and_then(|r| r.strip_prefix("bytes=")) {
        Some(range) if if_range_ok => {
            let start: usize = range.trim_end_matches('-').parse().unwrap();
            Response::new(206, "Partial Content")
                .header("ETag", "\"v1\"")
                .header(
                    "Content-Range",
                    format!("bytes {start}-{}/{}", CONTENT.len() - 1, CONTENT.len()),
                )
                .body(&CONTENT[start..])
        }
        _ => Response::new(200, "OK")
            .header("ETag", "\"v1\"")
            .header("Content-Type", "audio/mpeg")
            .body(CONTENT),
    }
}

#[tokio::test]
async fn test_full_fetch() {
    let (base, _) = serve(media_handler).await;
    let (events, body) = collect(&fetcher(), FetchRequest::new(format!("{base}/media"))).await;

    assert_eq!(body, CONTENT);
    let FetchEvent::Headers(head) = &events[0] else {
        panic!("expected headers first, got {events:?}");
    };
    assert_eq!(head.status, 200);
    assert_eq!(head.total_size, Some(CONTENT.len() as u64));
    assert_eq!(head.etag.as_deref(), Some("\"v1\""));
    assert_eq!(head.content_type.as_deref(), Some("audio/mpeg"));
    assert!(!head.resumed);
    assert_eq!(events.last(), Some(&FetchEvent::Completed));
}

#[tokio::test]
async fn test_range_request_resumes() {
    let (base, log) = serve(media_handler).await;
    let validator = ResumeValidator {
        etag: Some("\"v1\"".to_string()),
        last_modified: None,
        total_size: Some(CONTENT.len() as u64),
    };
    let request = FetchRequest::new(format!("{base}/media"))
        .with_range_start(5)
        .with_validator(Some(validator));
    let (events, body) = collect(&fetcher(), request).await;

    assert_eq!(body, &CONTENT[5..]);
    let FetchEvent::Headers(head) = &events[0] else {
        panic!("expected headers first, got {events:?}");
    };
    assert!(head.resumed);
    assert_eq!(head.total_size, Some(CONTENT.len() as u64));

    let sent = log.lock().unwrap()[0].clone();
    assert_eq!(sent.header("range"), Some("bytes=5-"));
    assert_eq!(sent.header("if-range"), Some("\"v1\""));
}

#[tokio::test]
async fn test_changed_resource_refuses_range() {
    let (base, _) = serve(media_handler).await;
    let validator = ResumeValidator {
        etag: Some("\"v0\"".to_string()),
        last_modified: None,
        total_size: None,
    };
    let request = FetchRequest::new(format!("{base}/media"))
        .with_range_start(5)
        .with_validator(Some(validator));
    let (events, body) = collect(&fetcher(), request).await;

    assert_eq!(events, vec![FetchEvent::RangeNotSupported]);
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_server_without_range_support() {
    let (base, _) = serve(|_: &Request| Response::new(200, "OK").body(CONTENT)).await;
    let request = FetchRequest::new(format!("{base}/media")).with_range_start(5);
    let (events, _) = collect(&fetcher(), request).await;

    assert_eq!(events, vec![FetchEvent::RangeNotSupported]);
}

#[tokio::test]
async fn test_redirect_is_reported_not_followed() {
    let (base, log) = serve(media_handler).await;
    let (events, _) = collect(&fetcher(), FetchRequest::new(format!("{base}/moved"))).await;

    assert_eq!(events, vec![FetchEvent::Redirect(format!("{base}/media"))]);
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_error_status_fails() {
    let (base, _) = serve(media_handler).await;
    let (events, _) = collect(&fetcher(), FetchRequest::new(format!("{base}/missing"))).await;

    assert_eq!(events, vec![FetchEvent::Failed("HTTP 404 Not Found".to_string())]);
}

#[tokio::test]
async fn test_connection_refused_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (events, _) = collect(&fetcher(), FetchRequest::new(format!("http://{addr}/media"))).await;
    assert!(matches!(events.as_slice(), [FetchEvent::Failed(_)]), "{events:?}");
}

#[tokio::test]
async fn test_upload_streams_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("upload.bin");
    std::fs::write(&path, CONTENT).unwrap();

    let (base, log) = serve(|_: &Request| Response::new(201, "Created")).await;
    let mut handle = fetcher().upload(UploadRequest {
        url: format!("{base}/incoming"),
        path,
        method: UploadMethod::Put,
        headers: vec![("X-Test".to_string(), "1".to_string())],
    });

    let mut events = Vec::new();
    while let Some(event) = handle.next_event().await {
        events.push(event);
    }

    assert!(events.contains(&FetchEvent::Sent(CONTENT.len() as u64)), "{events:?}");
    assert_eq!(events.last(), Some(&FetchEvent::Completed));
    let received = log.lock().unwrap()[0].clone();
    assert_eq!(received.method, "PUT");
    assert_eq!(received.body, CONTENT);
    assert_eq!(received.header("x-test"), Some("1"));
}

#[tokio::test]
async fn test_transfer_follows_redirect_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (base, _) = serve(media_handler).await;

    let transfer = Transfer::new(TransferContext::new(Arc::new(fetcher())));
    transfer.set_url(format!("{base}/moved"));
    transfer.set_file_name("track.mp3");
    transfer.set_download_path(dir.path());

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);
    assert_eq!(std::fs::read(dir.path().join("track.mp3")).unwrap(), CONTENT);
    assert_eq!(transfer.progress(), 100);
}

#[tokio::test]
async fn test_transfer_resumes_byte_identical_end_to_end() {
    let dir = TempDir::new().unwrap();
    let (base, log) = serve(media_handler).await;

    let transfer = Transfer::new(TransferContext::new(Arc::new(fetcher())));
    transfer.set_id("resume");
    transfer.set_url(format!("{base}/media"));
    transfer.set_file_name("track.mp3");
    transfer.set_download_path(dir.path());

    let partial = transfer.partial_path();
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, &CONTENT[..8]).unwrap();
    store_validator(
        &partial,
        &ResumeValidator {
            etag: Some("\"v1\"".to_string()),
            last_modified: None,
            total_size: Some(CONTENT.len() as u64),
        },
    )
    .await
    .unwrap();

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);
    assert_eq!(std::fs::read(dir.path().join("track.mp3")).unwrap(), CONTENT);
    assert_eq!(log.lock().unwrap()[0].header("range"), Some("bytes=8-"));
}

#[tokio::test]
async fn test_transfer_reports_http_error() {
    let dir = TempDir::new().unwrap();
    let (base, _) = serve(media_handler).await;

    let transfer = Transfer::new(TransferContext::new(Arc::new(fetcher())));
    transfer.set_url(format!("{base}/missing"));
    transfer.set_file_name("x");
    transfer.set_download_path(dir.path());

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Failed);
    assert_eq!(transfer.error_string(), "Network error: HTTP 404 Not Found");
}
