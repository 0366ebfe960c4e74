//! State-machine scenarios driven by scripted HTTP exchanges.

#![allow(clippy::unwrap_used, clippy::panic)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tunedrop_core::sink::{partial_path, sidecar_path, store_validator};
use tunedrop_core::{
    AudioFormat, FetchEvent, FetchHandle, FetchRequest, Fetcher, PostProcessor, ResponseHead,
    ResumeValidator, SchedulerConfig, Transfer, TransferContext, TransferError, TransferEvent,
    TransferPriority, TransferScheduler, TransferStatus, TransferType, UploadRequest,
};

enum Script {
    /// Events delivered as soon as the exchange starts.
    Events(Vec<FetchEvent>),
    /// Events fed by the test through the matching sender.
    Live(mpsc::Receiver<FetchEvent>),
}

/// Fetcher that answers each call with the next scripted exchange.
#[derive(Default)]
struct ScriptedFetcher {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<FetchRequest>>,
    uploads: Mutex<Vec<UploadRequest>>,
}

impl ScriptedFetcher {
    fn push(&self, events: Vec<FetchEvent>) {
        self.scripts.lock().unwrap().push_back(Script::Events(events));
    }

    fn push_live(&self) -> mpsc::Sender<FetchEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.scripts.lock().unwrap().push_back(Script::Live(rx));
        tx
    }

    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().unwrap().clone()
    }

    fn next_exchange(&self) -> FetchHandle {
        match self.scripts.lock().unwrap().pop_front() {
            Some(Script::Events(events)) => {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    tx.try_send(event).unwrap();
                }
                FetchHandle::new(rx, None)
            }
            Some(Script::Live(rx)) => FetchHandle::new(rx, None),
            None => FetchHandle::failed("no scripted exchange"),
        }
    }
}

impl Fetcher for ScriptedFetcher {
    fn fetch(&self, request: FetchRequest) -> FetchHandle {
        self.requests.lock().unwrap().push(request);
        self.next_exchange()
    }

    fn upload(&self, request: UploadRequest) -> FetchHandle {
        self.uploads.lock().unwrap().push(request);
        self.next_exchange()
    }
}

fn headers(total: Option<u64>) -> FetchEvent {
    FetchEvent::Headers(ResponseHead {
        status: 200,
        content_length: total,
        total_size: total,
        etag: Some("\"v1\"".to_string()),
        ..Default::default()
    })
}

fn resumed_headers(offset: u64, total: u64) -> FetchEvent {
    FetchEvent::Headers(ResponseHead {
        status: 206,
        content_length: Some(total - offset),
        total_size: Some(total),
        etag: Some("\"v1\"".to_string()),
        resumed: true,
        ..Default::default()
    })
}

fn data(bytes: &[u8]) -> FetchEvent {
    FetchEvent::Data(Bytes::copy_from_slice(bytes))
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn new_transfer(fetcher: &Arc<ScriptedFetcher>, dir: &Path, id: &str) -> Transfer {
    let transfer = Transfer::new(TransferContext::new(Arc::clone(fetcher) as Arc<dyn Fetcher>));
    transfer.set_id(id);
    transfer.set_url(format!("http://media.test/{id}"));
    transfer.set_file_name(id);
    transfer.set_file_extension("mp3");
    transfer.set_download_path(dir);
    transfer
}

/// Record every event a transfer emits.
fn record(transfer: &Transfer) -> Arc<Mutex<Vec<TransferEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    transfer.subscribe(move |_, event| sink.lock().unwrap().push(event.clone()));
    events
}

fn statuses(events: &Mutex<Vec<TransferEvent>>) -> Vec<TransferStatus> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            TransferEvent::StatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn progress(events: &Mutex<Vec<TransferEvent>>) -> Vec<(u64, u8)> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            TransferEvent::ProgressChanged {
                bytes_transferred,
                progress,
            } => Some((*bytes_transferred, *progress)),
            _ => None,
        })
        .collect()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_known_size_reports_quarter_steps() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let content = body(1000);
    let mut script = vec![headers(Some(1000))];
    script.extend(content.chunks(250).map(data));
    script.push(FetchEvent::Completed);
    fetcher.push(script);

    let transfer = new_transfer(&fetcher, dir.path(), "a");
    let events = record(&transfer);

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    let percentages: Vec<u8> = progress(&events).into_iter().map(|(_, p)| p).collect();
    assert_eq!(percentages, vec![25, 50, 75, 100]);
    assert_eq!(
        statuses(&events),
        vec![
            TransferStatus::Connecting,
            TransferStatus::Downloading,
            TransferStatus::Completed,
        ]
    );
    assert_eq!(std::fs::read(dir.path().join("a.mp3")).unwrap(), content);
    assert_eq!(transfer.output_path(), Some(dir.path().join("a.mp3")));
    assert!(!transfer.partial_path().exists());
}

#[tokio::test]
async fn test_pause_then_resume_with_range_request() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let content = body(1000);

    let live = fetcher.push_live();
    let transfer = new_transfer(&fetcher, dir.path(), "b");
    let events = record(&transfer);

    assert!(transfer.start());
    live.send(headers(Some(1000))).await.unwrap();
    live.send(data(&content[..300])).await.unwrap();
    eventually(|| transfer.bytes_transferred() == 300).await;

    transfer.pause().await;
    assert_eq!(transfer.status(), TransferStatus::Paused);
    let partial = transfer.partial_path();
    assert_eq!(std::fs::read(&partial).unwrap(), &content[..300]);
    assert!(sidecar_path(&partial).exists());

    fetcher.push(vec![
        resumed_headers(300, 1000),
        data(&content[300..700]),
        data(&content[700..]),
        FetchEvent::Completed,
    ]);
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    let requests = fetcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].range_start, 0);
    assert_eq!(requests[1].range_start, 300);
    assert_eq!(
        requests[1].validator.as_ref().and_then(|v| v.etag.as_deref()),
        Some("\"v1\"")
    );

    assert_eq!(transfer.bytes_transferred(), 1000);
    assert_eq!(std::fs::read(dir.path().join("b.mp3")).unwrap(), content);

    let bytes: Vec<u64> = progress(&events).into_iter().map(|(b, _)| b).collect();
    assert!(bytes.windows(2).all(|w| w[0] <= w[1]), "{bytes:?}");
    assert_eq!(
        statuses(&events),
        vec![
            TransferStatus::Connecting,
            TransferStatus::Downloading,
            TransferStatus::Paused,
            TransferStatus::Connecting,
            TransferStatus::Downloading,
            TransferStatus::Completed,
        ]
    );
}

#[tokio::test]
async fn test_redirect_loop_fails_after_bound() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    for hop in 1..=9 {
        fetcher.push(vec![FetchEvent::Redirect(format!("http://media.test/hop{hop}"))]);
    }

    let transfer = new_transfer(&fetcher, dir.path(), "c");
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Failed);

    assert_eq!(transfer.error_string(), "Too many redirects (limit 8)");
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 9);
    assert_eq!(requests[0].url, "http://media.test/c");
    assert_eq!(requests[8].url, "http://media.test/hop8");
}

#[tokio::test]
async fn test_redirects_within_bound_are_followed() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    for hop in 1..=3 {
        fetcher.push(vec![FetchEvent::Redirect(format!("http://media.test/hop{hop}"))]);
    }
    fetcher.push(vec![headers(Some(2)), data(b"ok"), FetchEvent::Completed]);

    let transfer = Transfer::new(
        TransferContext::new(Arc::clone(&fetcher) as Arc<dyn Fetcher>).with_max_redirects(3),
    );
    transfer.set_url("http://media.test/start");
    transfer.set_file_name("r.bin");
    transfer.set_download_path(dir.path());

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);
    assert_eq!(fetcher.requests()[3].url, "http://media.test/hop3");
    assert_eq!(transfer.url(), "http://media.test/start");
}

#[tokio::test]
async fn test_unknown_size_reaches_100_only_at_completion() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let content = body(4096);
    let mut script = vec![headers(None)];
    script.extend(content.chunks(1024).map(data));
    script.push(FetchEvent::Completed);
    fetcher.push(script);

    let transfer = new_transfer(&fetcher, dir.path(), "d");
    let events = record(&transfer);

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    let updates = progress(&events);
    let (last, before) = updates.split_last().unwrap();
    assert_eq!(*last, (4096, 100));
    assert!(before.iter().all(|(_, p)| *p == 0), "{updates:?}");
    assert_eq!(transfer.size(), None);
    assert_eq!(transfer.size_or_unknown(), -1);
    assert_eq!(std::fs::read(dir.path().join("d.mp3")).unwrap(), content);
}

#[tokio::test]
async fn test_cancel_removes_partial_file() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let live = fetcher.push_live();
    let transfer = new_transfer(&fetcher, dir.path(), "e");

    assert!(transfer.start());
    live.send(headers(Some(1000))).await.unwrap();
    live.send(data(&body(100))).await.unwrap();
    eventually(|| transfer.bytes_transferred() == 100).await;
    let partial = transfer.partial_path();
    assert!(partial.exists());

    transfer.cancel().await;
    assert_eq!(transfer.status(), TransferStatus::Canceled);
    assert_eq!(transfer.error_string(), "Canceled by user");
    assert!(!partial.exists());
    assert!(!sidecar_path(&partial).exists());
    assert!(!dir.path().join("e.mp3").exists());

    // Terminal: further commands are no-ops.
    assert!(!transfer.start());
    transfer.pause().await;
    assert_eq!(transfer.status(), TransferStatus::Canceled);
}

#[tokio::test]
async fn test_refused_range_falls_back_to_full_fetch() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let transfer = new_transfer(&fetcher, dir.path(), "f");

    let partial = transfer.partial_path();
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, body(300)).unwrap();
    store_validator(
        &partial,
        &ResumeValidator {
            etag: Some("\"old\"".to_string()),
            last_modified: None,
            total_size: Some(1000),
        },
    )
    .await
    .unwrap();

    let fresh: Vec<u8> = body(1000).into_iter().rev().collect();
    fetcher.push(vec![FetchEvent::RangeNotSupported]);
    fetcher.push(vec![headers(Some(1000)), data(&fresh), FetchEvent::Completed]);

    let events = record(&transfer);
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    let requests = fetcher.requests();
    assert_eq!(requests[0].range_start, 300);
    assert_eq!(requests[1].range_start, 0);
    assert_eq!(requests[1].validator, None);
    assert_eq!(std::fs::read(dir.path().join("f.mp3")).unwrap(), fresh);

    let bytes: Vec<u64> = progress(&events).into_iter().map(|(b, _)| b).collect();
    assert_eq!(bytes, vec![300, 0, 1000]);
}

#[tokio::test]
async fn test_partial_without_resume_data_is_refetched() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let transfer = new_transfer(&fetcher, dir.path(), "g");

    let partial = partial_path(&dir.path().join(".incomplete"), "g", "g");
    assert_eq!(partial, transfer.partial_path());
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, b"stale").unwrap();

    fetcher.push(vec![headers(Some(3)), data(b"new"), FetchEvent::Completed]);
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    assert_eq!(fetcher.requests()[0].range_start, 0);
    assert_eq!(std::fs::read(dir.path().join("g.mp3")).unwrap(), b"new");
}

#[tokio::test]
async fn test_existing_destination_is_not_overwritten() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("h.mp3"), b"mine").unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(vec![headers(Some(3)), data(b"new"), FetchEvent::Completed]);

    let transfer = new_transfer(&fetcher, dir.path(), "h");
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    assert_eq!(std::fs::read(dir.path().join("h.mp3")).unwrap(), b"mine");
    assert_eq!(std::fs::read(dir.path().join("h (1).mp3")).unwrap(), b"new");
}

#[tokio::test]
async fn test_body_closed_early_fails_then_resumes() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    let content = body(10);
    fetcher.push(vec![headers(Some(10)), data(&content[..4]), FetchEvent::Completed]);

    let transfer = new_transfer(&fetcher, dir.path(), "i");
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Failed);
    assert!(transfer.status_string().starts_with("Failed: "));

    // A failed transfer can be queued again and picks up where it stopped.
    fetcher.push(vec![
        resumed_headers(4, 10),
        data(&content[4..]),
        FetchEvent::Completed,
    ]);
    assert!(transfer.queue());
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);
    assert_eq!(fetcher.requests()[1].range_start, 4);
    assert_eq!(std::fs::read(dir.path().join("i.mp3")).unwrap(), content);
    assert_eq!(transfer.error_string(), "");
}

#[tokio::test]
async fn test_upload_reports_sent_bytes() {
    let dir = TempDir::new().unwrap();
    let local = dir.path().join("u.mp3");
    std::fs::write(&local, b"abcd").unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(vec![
        FetchEvent::Sent(2),
        FetchEvent::Sent(4),
        headers(None),
        FetchEvent::Completed,
    ]);

    let transfer = new_transfer(&fetcher, dir.path(), "u");
    transfer.set_transfer_type(TransferType::Upload);
    let events = record(&transfer);

    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Completed);

    assert_eq!(
        statuses(&events),
        vec![
            TransferStatus::Connecting,
            TransferStatus::Uploading,
            TransferStatus::Completed,
        ]
    );
    let updates = progress(&events);
    assert!(updates.contains(&(2, 50)), "{updates:?}");
    assert_eq!(updates.last(), Some(&(4, 100)));
    assert_eq!(transfer.size(), Some(4));
    assert_eq!(transfer.output_path(), Some(local.clone()));

    let uploads = fetcher.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].url, "http://media.test/u");
    assert_eq!(uploads[0].path, local);
    assert!(fetcher.requests().is_empty());
}

#[tokio::test]
async fn test_unwritable_destination_fails() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(vec![headers(Some(3)), data(b"abc"), FetchEvent::Completed]);

    let transfer = new_transfer(&fetcher, &blocker, "v");
    assert!(transfer.start());
    assert_eq!(transfer.wait_until_finished().await, TransferStatus::Failed);

    assert!(transfer.status_string().starts_with("Failed: "));
    assert!(transfer.error_string().contains(".incomplete"), "{}", transfer.error_string());
    assert_eq!(transfer.output_path(), None);
    assert_eq!(std::fs::read(&blocker).unwrap(), b"not a directory");
}

/// Converter that never finishes.
struct StalledConverter;

#[async_trait]
impl PostProcessor for StalledConverter {
    async fn convert(
        &self,
        _source: &Path,
        _format: AudioFormat,
    ) -> Result<PathBuf, TransferError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_cancel_while_converting_removes_placed_file() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(vec![headers(Some(3)), data(b"abc"), FetchEvent::Completed]);

    let transfer = Transfer::new(
        TransferContext::new(Arc::clone(&fetcher) as Arc<dyn Fetcher>)
            .with_post_processor(Arc::new(StalledConverter)),
    );
    transfer.set_url("http://media.test/w");
    transfer.set_file_name("w");
    transfer.set_file_extension("webm");
    transfer.set_download_path(dir.path());
    transfer.set_conversion_format(Some(AudioFormat::Mp3));

    assert!(transfer.start());
    eventually(|| transfer.status() == TransferStatus::Converting).await;
    let placed = dir.path().join("w.webm");
    assert!(placed.exists());

    transfer.cancel().await;
    assert_eq!(transfer.status(), TransferStatus::Canceled);
    assert!(!placed.exists());
    assert!(!transfer.partial_path().exists());
}

/// Fetcher whose exchanges stay open until the test completes them.
#[derive(Default)]
struct GateFetcher {
    open: Mutex<Vec<mpsc::Sender<FetchEvent>>>,
}

impl GateFetcher {
    fn open_count(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    async fn complete_oldest(&self) {
        let tx = self.open.lock().unwrap().remove(0);
        tx.send(headers(Some(1))).await.unwrap();
        tx.send(data(b"x")).await.unwrap();
        tx.send(FetchEvent::Completed).await.unwrap();
    }
}

impl Fetcher for GateFetcher {
    fn fetch(&self, _request: FetchRequest) -> FetchHandle {
        let (tx, rx) = mpsc::channel(4);
        self.open.lock().unwrap().push(tx);
        FetchHandle::new(rx, None)
    }
}

#[tokio::test]
async fn test_scheduler_never_exceeds_limit() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(GateFetcher::default());
    let scheduler = TransferScheduler::with_config(SchedulerConfig {
        max_concurrent_transfers: 2,
    });

    let transfers: Vec<Transfer> = (0..5)
        .map(|i| {
            let t = Transfer::new(TransferContext::new(Arc::clone(&fetcher) as Arc<dyn Fetcher>));
            t.set_id(format!("t{i}"));
            t.set_url(format!("http://media.test/{i}"));
            t.set_file_name(format!("t{i}.bin"));
            t.set_download_path(dir.path());
            scheduler.attach(&t);
            t
        })
        .collect();
    for t in &transfers {
        assert!(t.queue());
    }

    let running = |ts: &[Transfer]| ts.iter().filter(|t| t.status().is_active()).count();

    for done in 0..5 {
        let expected = (5 - done).min(2);
        eventually(|| fetcher.open_count() == expected).await;
        assert!(running(&transfers) <= 2);
        assert!(scheduler.active_count() <= 2);
        fetcher.complete_oldest().await;
    }

    for t in &transfers {
        assert_eq!(t.wait_until_finished().await, TransferStatus::Completed);
    }
    assert_eq!(scheduler.active_count(), 0);
    assert_eq!(scheduler.stats().completed, 5);
}

#[tokio::test]
async fn test_scheduler_admits_by_priority_then_fifo() {
    let dir = TempDir::new().unwrap();
    let fetcher = Arc::new(ScriptedFetcher::default());
    for _ in 0..5 {
        fetcher.push(vec![headers(Some(1)), data(b"x"), FetchEvent::Completed]);
    }
    let scheduler = TransferScheduler::with_config(SchedulerConfig {
        max_concurrent_transfers: 1,
    });

    let order = Arc::new(Mutex::new(Vec::new()));
    let specs = [
        ("first", TransferPriority::Normal),
        ("low", TransferPriority::Low),
        ("normal1", TransferPriority::Normal),
        ("high", TransferPriority::High),
        ("normal2", TransferPriority::Normal),
    ];
    let transfers: Vec<Transfer> = specs
        .iter()
        .map(|(id, priority)| {
            let t = new_transfer(&fetcher, dir.path(), id);
            t.set_priority(*priority);
            let sink = Arc::clone(&order);
            t.subscribe(move |t, event| {
                if let TransferEvent::StatusChanged {
                    status: TransferStatus::Connecting,
                    ..
                } = event
                {
                    sink.lock().unwrap().push(t.id());
                }
            });
            scheduler.attach(&t);
            t
        })
        .collect();

    for t in &transfers {
        t.queue();
    }
    for t in &transfers {
        assert_eq!(t.wait_until_finished().await, TransferStatus::Completed);
    }

    assert_eq!(
        *order.lock().unwrap(),
        vec!["first", "high", "normal1", "normal2", "low"]
    );
}
