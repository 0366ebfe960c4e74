//! Single-exchange HTTP fetching with resume support.
//!
//! A [`Fetcher`] performs exactly one HTTP exchange per call and reports what
//! happened as an ordered stream of [`FetchEvent`]s. It never follows
//! redirects itself and never touches the destination file: the transfer
//! state machine decides what to do with a redirect, a refused range, or each
//! body chunk.
//!
//! ```rust,ignore
//! use tunedrop_core::fetch::{FetchConfig, FetchEvent, FetchRequest, Fetcher, HttpFetcher};
//!
//! let fetcher = HttpFetcher::new(FetchConfig::default())?;
//! let mut handle = fetcher.fetch(FetchRequest::new("https://example.com/track.ogg"));
//! while let Some(event) = handle.next_event().await {
//!     if let FetchEvent::Data(chunk) = event {
//!         println!("{} bytes", chunk.len());
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG, HeaderMap, IF_RANGE, LAST_MODIFIED,
    LOCATION, RANGE,
};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default bound on consecutive redirects.
pub const DEFAULT_MAX_REDIRECTS: u32 = 8;

/// Smallest redirect bound accepted by [`FetchConfig::validate`].
pub const MIN_REDIRECTS: u32 = 1;

/// Largest redirect bound accepted by [`FetchConfig::validate`].
pub const MAX_REDIRECTS: u32 = 32;

/// Number of events buffered between the network task and its consumer.
const EVENT_BUFFER: usize = 16;

/// HTTP configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchConfig {
    /// Redirect hops allowed before a transfer fails.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Maximum silence between body reads, in seconds.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// User agent sent with every request.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

const fn default_max_redirects() -> u32 {
    DEFAULT_MAX_REDIRECTS
}

const fn default_connect_timeout() -> u64 {
    30
}

const fn default_read_timeout() -> u64 {
    60
}

fn default_user_agent() -> String {
    format!("tunedrop/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl FetchConfig {
    /// Clamp values to their supported ranges.
    pub fn validate(&mut self) {
        self.max_redirects = self.max_redirects.clamp(MIN_REDIRECTS, MAX_REDIRECTS);
        self.connect_timeout_secs = self.connect_timeout_secs.max(1);
        self.read_timeout_secs = self.read_timeout_secs.max(1);
    }
}

/// What the server told us about a resource, kept alongside a partial file
/// so a later resume only succeeds against the same bytes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeValidator {
    /// Strong entity tag, if the server sent one.
    pub etag: Option<String>,
    /// `Last-Modified` date, used when there is no entity tag.
    pub last_modified: Option<String>,
    /// Full size of the resource.
    pub total_size: Option<u64>,
}

impl ResumeValidator {
    /// Build a validator from a response head.
    #[must_use]
    pub fn from_head(head: &ResponseHead) -> Self {
        Self {
            etag: head.etag.clone(),
            last_modified: head.last_modified.clone(),
            total_size: head.total_size,
        }
    }

    /// Value for an `If-Range` header. Weak tags cannot be used for ranges.
    #[must_use]
    pub fn if_range_value(&self) -> Option<&str> {
        match &self.etag {
            Some(tag) if !tag.starts_with("W/") => Some(tag.as_str()),
            _ => self.last_modified.as_deref(),
        }
    }
}

/// Parameters for a single GET exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// URL to fetch.
    pub url: String,
    /// First byte wanted; `0` fetches the whole resource.
    pub range_start: u64,
    /// Validator from the previous attempt, sent as `If-Range` when resuming.
    pub validator: Option<ResumeValidator>,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    /// Create a request for the whole resource.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range_start: 0,
            validator: None,
            headers: Vec::new(),
        }
    }

    /// Resume from `offset`.
    #[must_use]
    pub const fn with_range_start(mut self, offset: u64) -> Self {
        self.range_start = offset;
        self
    }

    /// Attach the validator recorded for the partial file.
    #[must_use]
    pub fn with_validator(mut self, validator: Option<ResumeValidator>) -> Self {
        self.validator = validator;
        self
    }

    /// Add a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// HTTP method used to upload a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadMethod {
    /// `PUT` the file as the request body.
    #[default]
    Put,
    /// `POST` the file as the request body.
    Post,
}

/// Parameters for a single upload exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Destination URL.
    pub url: String,
    /// Local file sent as the body.
    pub path: PathBuf,
    /// HTTP method.
    pub method: UploadMethod,
    /// Extra request headers.
    pub headers: Vec<(String, String)>,
}

/// Status line and the headers the transfer cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseHead {
    /// HTTP status code.
    pub status: u16,
    /// Length of this response's body.
    pub content_length: Option<u64>,
    /// Full size of the resource, accounting for any range.
    pub total_size: Option<u64>,
    /// Entity tag.
    pub etag: Option<String>,
    /// `Last-Modified` header.
    pub last_modified: Option<String>,
    /// `Content-Type` header.
    pub content_type: Option<String>,
    /// Whether the body continues a partial file.
    pub resumed: bool,
}

/// One step of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Response headers arrived with a usable status.
    Headers(ResponseHead),
    /// A body chunk, in body order.
    Data(Bytes),
    /// Cumulative bytes of an upload body handed to the connection.
    Sent(u64),
    /// The server redirected to this absolute URL.
    Redirect(String),
    /// A resume was requested but the server will not (or can no longer) honour it.
    RangeNotSupported,
    /// The body finished cleanly.
    Completed,
    /// The exchange failed.
    Failed(String),
}

/// Receiving end of one exchange. Dropping it aborts the exchange.
#[derive(Debug)]
pub struct FetchHandle {
    events: mpsc::Receiver<FetchEvent>,
    task: Option<JoinHandle<()>>,
}

impl FetchHandle {
    /// Wrap an event channel and the task feeding it.
    pub const fn new(events: mpsc::Receiver<FetchEvent>, task: Option<JoinHandle<()>>) -> Self {
        Self { events, task }
    }

    /// A handle that reports `reason` as its only event.
    pub fn failed(reason: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(FetchEvent::Failed(reason.into()));
        Self::new(rx, None)
    }

    /// Wait for the next event. `None` once the exchange has ended.
    pub async fn next_event(&mut self) -> Option<FetchEvent> {
        self.events.recv().await
    }

    /// Abort the underlying exchange. Safe to call more than once.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.events.close();
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Something that can run single HTTP exchanges.
pub trait Fetcher: Send + Sync {
    /// Start a GET exchange.
    fn fetch(&self, request: FetchRequest) -> FetchHandle;

    /// Start an upload exchange.
    fn upload(&self, request: UploadRequest) -> FetchHandle {
        FetchHandle::failed(format!("Uploads are not supported for {}", request.url))
    }
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher with its own client.
    pub fn new(config: FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(config.user_agent)
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Use a shared client. It must be built with redirects disabled, otherwise
    /// redirect hops are neither counted nor bounded.
    pub const fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_fetch(self.client.clone(), request, tx));
        FetchHandle::new(rx, Some(task))
    }

    fn upload(&self, request: UploadRequest) -> FetchHandle {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(run_upload(self.client.clone(), request, tx));
        FetchHandle::new(rx, Some(task))
    }
}

async fn run_fetch(client: Client, request: FetchRequest, tx: mpsc::Sender<FetchEvent>) {
    let mut builder = client.get(&request.url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if request.range_start > 0 {
        builder = builder.header(RANGE, format!("bytes={}-", request.range_start));
        if let Some(value) = request
            .validator
            .as_ref()
            .and_then(ResumeValidator::if_range_value)
        {
            builder = builder.header(IF_RANGE, value);
        }
        info!("Requesting {} from byte {}", request.url, request.range_start);
    } else {
        debug!("Requesting {}", request.url);
    }

    let mut response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send(FetchEvent::Failed(describe_error(&e))).await;
            return;
        }
    };

    let status = response.status();
    if status.is_redirection() {
        let _ = tx.send(redirect_event(&response)).await;
        return;
    }

    if request.range_start > 0
        && (status == StatusCode::RANGE_NOT_SATISFIABLE
            || (status.is_success() && status != StatusCode::PARTIAL_CONTENT))
    {
        warn!(
            "Server answered {} to a range request for {}",
            status, request.url
        );
        let _ = tx.send(FetchEvent::RangeNotSupported).await;
        return;
    }

    if !status.is_success() {
        let _ = tx.send(FetchEvent::Failed(format!("HTTP {status}"))).await;
        return;
    }

    let head = response_head(status, response.headers(), request.range_start);
    if request.range_start > 0 && !range_matches(&response, &request, &head) {
        warn!("Resource at {} changed since the partial download", request.url);
        let _ = tx.send(FetchEvent::RangeNotSupported).await;
        return;
    }

    if tx.send(FetchEvent::Headers(head)).await.is_err() {
        return;
    }

    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                if tx.send(FetchEvent::Data(chunk)).await.is_err() {
                    return;
                }
            }
            Ok(None) => {
                let _ = tx.send(FetchEvent::Completed).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(FetchEvent::Failed(describe_error(&e))).await;
                return;
            }
        }
    }
}

async fn run_upload(client: Client, request: UploadRequest, tx: mpsc::Sender<FetchEvent>) {
    let file = match tokio::fs::File::open(&request.path).await {
        Ok(file) => file,
        Err(e) => {
            let reason = format!("Failed to open {}: {e}", request.path.display());
            let _ = tx.send(FetchEvent::Failed(reason)).await;
            return;
        }
    };
    let length = file.metadata().await.ok().map(|m| m.len());

    let progress_tx = tx.clone();
    let mut sent = 0u64;
    let body = ReaderStream::new(file).map(move |chunk| {
        if let Ok(bytes) = &chunk {
            sent += bytes.len() as u64;
            // Cumulative totals, so a dropped update is harmless.
            let _ = progress_tx.try_send(FetchEvent::Sent(sent));
        }
        chunk
    });

    let mut builder = match request.method {
        UploadMethod::Put => client.put(&request.url),
        UploadMethod::Post => client.post(&request.url),
    };
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(length) = length {
        builder = builder.header(CONTENT_LENGTH, length);
    }

    info!("Uploading {} to {}", request.path.display(), request.url);
    let response = match builder.body(reqwest::Body::wrap_stream(body)).send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = tx.send(FetchEvent::Failed(describe_error(&e))).await;
            return;
        }
    };

    let status = response.status();
    if status.is_redirection() {
        let _ = tx.send(redirect_event(&response)).await;
        return;
    }
    if !status.is_success() {
        let _ = tx.send(FetchEvent::Failed(format!("HTTP {status}"))).await;
        return;
    }

    let head = response_head(status, response.headers(), 0);
    if tx.send(FetchEvent::Headers(head)).await.is_ok() {
        let _ = tx.send(FetchEvent::Completed).await;
    }
}

fn redirect_event(response: &reqwest::Response) -> FetchEvent {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok());
    match location {
        Some(location) => match response.url().join(location) {
            Ok(target) => {
                debug!("Redirected from {} to {}", response.url(), target);
                FetchEvent::Redirect(target.to_string())
            }
            Err(e) => FetchEvent::Failed(format!("Invalid redirect location '{location}': {e}")),
        },
        None => FetchEvent::Failed(format!(
            "HTTP {} without a Location header",
            response.status()
        )),
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn response_head(status: StatusCode, headers: &HeaderMap, range_start: u64) -> ResponseHead {
    let content_length = header_string(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok());
    let resumed = status == StatusCode::PARTIAL_CONTENT && range_start > 0;
    let total_size = if resumed {
        header_string(headers, CONTENT_RANGE)
            .and_then(|v| parse_content_range(&v))
            .and_then(|range| range.total)
            .or_else(|| content_length.map(|len| len + range_start))
    } else {
        content_length
    };

    ResponseHead {
        status: status.as_u16(),
        content_length,
        total_size,
        etag: header_string(headers, ETAG),
        last_modified: header_string(headers, LAST_MODIFIED),
        content_type: header_string(headers, CONTENT_TYPE),
        resumed,
    }
}

/// A 206 body is only usable if it starts where the partial file ends and
/// describes the same resource the validator was taken from.
fn range_matches(
    response: &reqwest::Response,
    request: &FetchRequest,
    head: &ResponseHead,
) -> bool {
    let range = header_string(response.headers(), CONTENT_RANGE)
        .and_then(|v| parse_content_range(&v));
    if let Some(range) = range
        && range.start != request.range_start
    {
        return false;
    }

    let Some(validator) = &request.validator else {
        return true;
    };
    if let (Some(expected), Some(actual)) = (validator.total_size, head.total_size)
        && expected != actual
    {
        return false;
    }
    if let (Some(expected), Some(actual)) = (&validator.etag, &head.etag)
        && expected != actual
    {
        return false;
    }
    true
}

/// Parsed `Content-Range: bytes start-end/total` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte in the body.
    pub start: u64,
    /// Last byte in the body (inclusive).
    pub end: u64,
    /// Full size, unless the server sent `*`.
    pub total: Option<u64>,
}

static CONTENT_RANGE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\s*bytes\s+(\d+)-(\d+)/(\d+|\*)\s*$").ok());

/// Parse a `Content-Range` header value.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let caps = CONTENT_RANGE_RE.as_ref()?.captures(value)?;
    let start = caps.get(1)?.as_str().parse().ok()?;
    let end = caps.get(2)?.as_str().parse().ok()?;
    let total = match caps.get(3)?.as_str() {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    (start <= end).then_some(ContentRange { start, end, total })
}

fn describe_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("Connection timed out: {err}")
    } else if err.is_connect() {
        format!("Connection failed: {err}")
    } else {
        err.to_string()
    }
}
