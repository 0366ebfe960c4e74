//! The transfer state machine.
//!
//! A [`Transfer`] is one logical download or upload. It is a cheap handle
//! around shared state: clones refer to the same transfer. Commands
//! ([`Transfer::queue`], [`Transfer::start`], [`Transfer::pause`],
//! [`Transfer::cancel`]) are no-ops when the transition is not valid from the
//! current status.
//!
//! Each `start()` spawns one controller task. The controller resolves a stream
//! URL when needed, runs the HTTP exchange (following redirects up to a
//! bound and falling back to a full fetch once if a resume is refused), writes
//! the body into the partial file, moves it into place and optionally hands it
//! to a [`PostProcessor`].
//!
//! ```text
//!  Paused --queue--> Queued --start--> Connecting --headers--> Downloading/Uploading
//!     ^                                   |                         |
//!     +------------- pause ---------------+-------------------------+
//!                                                                   |
//!               Completed <-- Converting <-- (final file placed) <--+
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, INCOMPLETE_DIR_NAME};
use crate::convert::{AudioFormat, PostProcessor};
use crate::error::TransferError;
use crate::events::{Dispatcher, Listener, ListenerId, StatusNotifier, TransferEvent};
use crate::fetch::{
    DEFAULT_MAX_REDIRECTS, FetchEvent, FetchHandle, FetchRequest, Fetcher, ResumeValidator,
    UploadMethod, UploadRequest,
};
use crate::lock;
use crate::resolver::{StreamCandidate, StreamQuery, StreamResolver};
use crate::sink::{self, FileSink};

/// Error text left on a transfer canceled through [`Transfer::cancel`].
pub const CANCELED_BY_USER: &str = "Canceled by user";

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Not running; a later start resumes from the partial file.
    #[default]
    Paused,
    /// Stopped by the user. Terminal.
    Canceled,
    /// Stopped by an error. Terminal.
    Failed,
    /// Finished successfully. Terminal.
    Completed,
    /// Waiting for a scheduler slot.
    Queued,
    /// Resolving or waiting for response headers.
    Connecting,
    /// Receiving the body.
    Downloading,
    /// Sending the body.
    Uploading,
    /// Post-processing the finished file.
    Converting,
    /// Not set.
    Unknown,
}

impl TransferStatus {
    /// `Canceled`, `Failed` or `Completed`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Canceled | Self::Failed | Self::Completed)
    }

    /// Holding a scheduler slot.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Downloading | Self::Uploading | Self::Converting
        )
    }

    const fn is_pausable(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Downloading | Self::Uploading
        )
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paused => write!(f, "Paused"),
            Self::Canceled => write!(f, "Canceled"),
            Self::Failed => write!(f, "Failed"),
            Self::Completed => write!(f, "Completed"),
            Self::Queued => write!(f, "Queued"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Uploading => write!(f, "Uploading"),
            Self::Converting => write!(f, "Converting"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferPriority {
    /// Admitted after normal and high priority transfers.
    Low = 0,
    /// Normal priority (default).
    #[default]
    Normal = 1,
    /// Admitted before normal and low priority transfers.
    High = 2,
}

impl std::fmt::Display for TransferPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "Low"),
            Self::Normal => write!(f, "Normal"),
            Self::High => write!(f, "High"),
        }
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransferType {
    /// Fetch a remote resource into `download_path`.
    #[default]
    Download,
    /// Send `download_path/file_name` to `url`.
    Upload,
}

impl std::fmt::Display for TransferType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Download => write!(f, "Download"),
            Self::Upload => write!(f, "Upload"),
        }
    }
}

/// Collaborators shared by transfers.
#[derive(Clone)]
pub struct TransferContext {
    /// Runs HTTP exchanges.
    pub fetcher: Arc<dyn Fetcher>,
    /// Resolves stream URLs for transfers created without one.
    pub resolver: Option<Arc<dyn StreamResolver>>,
    /// Converts finished files.
    pub post_processor: Option<Arc<dyn PostProcessor>>,
    /// Told about every status change.
    pub notifier: Option<Arc<dyn StatusNotifier>>,
    /// Directory for partial files; `<download_path>/.incomplete` when unset.
    pub incomplete_directory: Option<PathBuf>,
    /// Redirect hops allowed per exchange.
    pub max_redirects: u32,
    /// Method used by upload transfers.
    pub upload_method: UploadMethod,
}

impl TransferContext {
    /// Context with only a fetcher.
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            fetcher,
            resolver: None,
            post_processor: None,
            notifier: None,
            incomplete_directory: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            upload_method: UploadMethod::default(),
        }
    }

    /// Context using the redirect bound and partial-file location from `config`.
    pub fn from_config(fetcher: Arc<dyn Fetcher>, config: &EngineConfig) -> Self {
        Self {
            incomplete_directory: config.incomplete_directory.clone(),
            max_redirects: config.fetch.max_redirects,
            ..Self::new(fetcher)
        }
    }

    /// Set the stream resolver.
    #[must_use]
    pub fn with_resolver(mut self, resolver: Arc<dyn StreamResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the post-processor.
    #[must_use]
    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = Some(post_processor);
        self
    }

    /// Set the status notifier.
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn StatusNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Set the partial-file directory.
    #[must_use]
    pub fn with_incomplete_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.incomplete_directory = Some(dir.into());
        self
    }

    /// Set the redirect bound.
    #[must_use]
    pub const fn with_max_redirects(mut self, max_redirects: u32) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Set the upload method.
    #[must_use]
    pub const fn with_upload_method(mut self, method: UploadMethod) -> Self {
        self.upload_method = method;
        self
    }
}

impl std::fmt::Debug for TransferContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferContext")
            .field("resolver", &self.resolver.is_some())
            .field("post_processor", &self.post_processor.is_some())
            .field("notifier", &self.notifier.is_some())
            .field("incomplete_directory", &self.incomplete_directory)
            .field("max_redirects", &self.max_redirects)
            .field("upload_method", &self.upload_method)
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a transfer's attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    /// Transfer id.
    pub id: String,
    /// Resource id within the service.
    pub resource_id: String,
    /// Source service.
    pub service: String,
    /// Resolved URL.
    pub url: String,
    /// Preferred stream.
    pub stream_id: String,
    /// Stream URL hint.
    pub stream_url: String,
    /// Category.
    pub category: String,
    /// Display title.
    pub title: String,
    /// Final file name.
    pub file_name: String,
    /// File extension.
    pub file_extension: String,
    /// Destination directory.
    pub download_path: PathBuf,
    /// Declared size.
    pub size: Option<u64>,
    /// Bytes transferred.
    pub bytes_transferred: u64,
    /// Progress percentage.
    pub progress: u8,
    /// Priority.
    pub priority: TransferPriority,
    /// Priority as text.
    pub priority_string: String,
    /// Status.
    pub status: TransferStatus,
    /// Status as text.
    pub status_string: String,
    /// Last error.
    pub error_string: String,
    /// Direction.
    pub transfer_type: TransferType,
    /// Post-processing target.
    pub conversion_format: Option<AudioFormat>,
    /// Where the finished file ended up.
    pub output_path: Option<PathBuf>,
}

impl TransferSnapshot {
    /// Title, or the file name for untitled transfers.
    #[must_use]
    pub fn title_or_file_name(&self) -> &str {
        if self.title.is_empty() {
            &self.file_name
        } else {
            &self.title
        }
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

fn round_progress(bytes: u64, size: Option<u64>) -> u8 {
    match size {
        Some(size) if size > 0 => {
            let bytes = u128::from(bytes.min(size));
            let size = u128::from(size);
            u8::try_from((200 * bytes + size) / (2 * size)).unwrap_or(100)
        }
        _ => 0,
    }
}

#[derive(Debug)]
struct State {
    id: String,
    resource_id: String,
    service: String,
    url: String,
    stream_id: String,
    stream_url: String,
    category: String,
    title: String,
    file_name: String,
    file_extension: String,
    download_path: PathBuf,
    size: Option<u64>,
    bytes_transferred: u64,
    progress: u8,
    priority: TransferPriority,
    status: TransferStatus,
    error_string: String,
    transfer_type: TransferType,
    conversion_format: Option<AudioFormat>,
    output_path: Option<PathBuf>,
    generation: u64,
    cancel: Option<CancellationToken>,
    changes: Vec<TransferEvent>,
}

impl State {
    fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed).to_string(),
            resource_id: String::new(),
            service: String::new(),
            url: String::new(),
            stream_id: String::new(),
            stream_url: String::new(),
            category: String::new(),
            title: String::new(),
            file_name: String::new(),
            file_extension: String::new(),
            download_path: PathBuf::new(),
            size: None,
            bytes_transferred: 0,
            progress: 0,
            priority: TransferPriority::default(),
            status: TransferStatus::Paused,
            error_string: String::new(),
            transfer_type: TransferType::default(),
            conversion_format: None,
            output_path: None,
            generation: 0,
            cancel: None,
            changes: Vec::new(),
        }
    }

    fn set_status(&mut self, status: TransferStatus, error: Option<&str>) {
        let error = error.unwrap_or_default();
        if self.status == status && self.error_string == error {
            return;
        }
        self.status = status;
        self.error_string = error.to_string();
        self.changes.push(TransferEvent::StatusChanged {
            status,
            error: (!error.is_empty()).then(|| error.to_string()),
        });
    }

    fn set_size(&mut self, size: Option<u64>) {
        if replace(&mut self.size, size) {
            self.changes.push(TransferEvent::SizeChanged(size));
            self.set_progress(round_progress(self.bytes_transferred, size));
        }
    }

    fn set_bytes(&mut self, bytes: u64) {
        if replace(&mut self.bytes_transferred, bytes) {
            self.progress = round_progress(bytes, self.size);
            self.changes.push(TransferEvent::ProgressChanged {
                bytes_transferred: bytes,
                progress: self.progress,
            });
        }
    }

    fn set_progress(&mut self, progress: u8) {
        if replace(&mut self.progress, progress) {
            self.changes.push(TransferEvent::ProgressChanged {
                bytes_transferred: self.bytes_transferred,
                progress,
            });
        }
    }

    fn set_url(&mut self, url: String) {
        if replace(&mut self.url, url) {
            self.changes.push(TransferEvent::UrlChanged(self.url.clone()));
        }
    }

    fn set_file_name(&mut self, name: String) {
        if replace(&mut self.file_name, name) {
            self.changes
                .push(TransferEvent::FileNameChanged(self.file_name.clone()));
        }
    }

    fn set_file_extension(&mut self, ext: String) {
        if replace(&mut self.file_extension, ext) {
            self.changes
                .push(TransferEvent::FileExtensionChanged(self.file_extension.clone()));
        }
    }

    fn status_string(&self) -> String {
        if self.status == TransferStatus::Failed && !self.error_string.is_empty() {
            format!("Failed: {}", self.error_string)
        } else {
            self.status.to_string()
        }
    }

    fn incomplete_directory(&self, context: &TransferContext) -> PathBuf {
        context
            .incomplete_directory
            .clone()
            .unwrap_or_else(|| self.download_path.join(INCOMPLETE_DIR_NAME))
    }

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            id: self.id.clone(),
            resource_id: self.resource_id.clone(),
            service: self.service.clone(),
            url: self.url.clone(),
            stream_id: self.stream_id.clone(),
            stream_url: self.stream_url.clone(),
            category: self.category.clone(),
            title: self.title.clone(),
            file_name: self.file_name.clone(),
            file_extension: self.file_extension.clone(),
            download_path: self.download_path.clone(),
            size: self.size,
            bytes_transferred: self.bytes_transferred,
            progress: self.progress,
            priority: self.priority,
            priority_string: self.priority.to_string(),
            status: self.status,
            status_string: self.status_string(),
            error_string: self.error_string.clone(),
            transfer_type: self.transfer_type,
            conversion_format: self.conversion_format,
            output_path: self.output_path.clone(),
        }
    }
}

struct Inner {
    context: TransferContext,
    state: Mutex<State>,
    dispatcher: Dispatcher,
    status_tx: watch::Sender<TransferStatus>,
    /// Held by the controller task for its whole run.
    run_lock: tokio::sync::Mutex<()>,
}

/// Handle to one transfer. Clones share state.
#[derive(Clone)]
pub struct Transfer {
    inner: Arc<Inner>,
}

macro_rules! string_property {
    ($(#[$doc:meta])* $field:ident, $setter:ident, $event:ident) => {
        $(#[$doc])*
        #[must_use]
        pub fn $field(&self) -> String {
            self.read(|s| s.$field.clone())
        }

        #[doc = concat!("Set `", stringify!($field), "`.")]
        pub fn $setter(&self, value: impl Into<String>) {
            let value = value.into();
            self.mutate(|s| {
                if replace(&mut s.$field, value) {
                    let event = TransferEvent::$event(s.$field.clone());
                    s.changes.push(event);
                }
            });
        }
    };
}

impl Transfer {
    /// Create a paused transfer.
    pub fn new(context: TransferContext) -> Self {
        let (status_tx, _) = watch::channel(TransferStatus::Paused);
        Self {
            inner: Arc::new(Inner {
                context,
                state: Mutex::new(State::new()),
                dispatcher: Dispatcher::new(),
                status_tx,
                run_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&lock(&self.inner.state))
    }

    /// Apply a mutation and deliver the events it produced.
    fn mutate<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let (result, notify) = {
            let mut state = lock(&self.inner.state);
            let result = f(&mut state);
            let changes = std::mem::take(&mut state.changes);
            let status_changed = changes
                .iter()
                .any(|e| matches!(e, TransferEvent::StatusChanged { .. }));
            if status_changed {
                self.inner.status_tx.send_replace(state.status);
            }
            self.inner.dispatcher.enqueue(changes);
            let notify = (status_changed && self.inner.context.notifier.is_some())
                .then(|| state.snapshot());
            (result, notify)
        };

        self.inner.dispatcher.dispatch(self);
        if let (Some(snapshot), Some(notifier)) = (notify, &self.inner.context.notifier) {
            notifier.status_changed(&snapshot);
        }
        result
    }

    /// Mutate only if `generation` is still the current run.
    fn mutate_run(&self, generation: u64, f: impl FnOnce(&mut State)) -> bool {
        self.mutate(|s| {
            if s.generation != generation {
                return false;
            }
            f(s);
            true
        })
    }

    // --- Attributes -------------------------------------------------------

    string_property!(
        /// Transfer id. Also keys the partial file.
        id,
        set_id,
        IdChanged
    );
    string_property!(
        /// Resource id within the service.
        resource_id,
        set_resource_id,
        ResourceIdChanged
    );
    string_property!(
        /// Resolved URL; empty until resolution.
        url,
        set_url,
        UrlChanged
    );
    string_property!(
        /// Preferred stream, passed to the resolver.
        stream_id,
        set_stream_id,
        StreamIdChanged
    );
    string_property!(
        /// Stream URL hint, used directly when there is no resolver.
        stream_url,
        set_stream_url,
        StreamUrlChanged
    );
    string_property!(
        /// Free-form category.
        category,
        set_category,
        CategoryChanged
    );
    string_property!(
        /// Display title.
        title,
        set_title,
        TitleChanged
    );
    string_property!(
        /// Final file name, without the extension unless the caller added it.
        file_name,
        set_file_name,
        FileNameChanged
    );
    string_property!(
        /// Extension of the finished file, without the dot.
        file_extension,
        set_file_extension,
        FileExtensionChanged
    );

    /// Source service.
    #[must_use]
    pub fn service(&self) -> String {
        self.read(|s| s.service.clone())
    }

    /// Set the source service. Only the first non-empty value is accepted.
    pub fn set_service(&self, service: impl Into<String>) -> bool {
        let service = service.into();
        self.mutate(|s| {
            if !s.service.is_empty() || service.is_empty() {
                return false;
            }
            s.service = service;
            s.changes
                .push(TransferEvent::ServiceChanged(s.service.clone()));
            true
        })
    }

    /// Destination directory.
    #[must_use]
    pub fn download_path(&self) -> PathBuf {
        self.read(|s| s.download_path.clone())
    }

    /// Set the destination directory.
    pub fn set_download_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        self.mutate(|s| {
            if replace(&mut s.download_path, path) {
                s.changes
                    .push(TransferEvent::DownloadPathChanged(s.download_path.clone()));
            }
        });
    }

    /// Declared total size, `None` when unknown.
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.read(|s| s.size)
    }

    /// Declared total size, `-1` when unknown.
    #[must_use]
    pub fn size_or_unknown(&self) -> i64 {
        self.size()
            .and_then(|size| i64::try_from(size).ok())
            .unwrap_or(-1)
    }

    /// Set the declared total size.
    pub fn set_size(&self, size: Option<u64>) {
        self.mutate(|s| s.set_size(size));
    }

    /// Bytes transferred so far.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.read(|s| s.bytes_transferred)
    }

    /// Progress, 0-100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        self.read(|s| s.progress)
    }

    /// Scheduling priority.
    #[must_use]
    pub fn priority(&self) -> TransferPriority {
        self.read(|s| s.priority)
    }

    /// Priority as display text.
    #[must_use]
    pub fn priority_string(&self) -> String {
        self.priority().to_string()
    }

    /// Set the priority.
    pub fn set_priority(&self, priority: TransferPriority) {
        self.mutate(|s| {
            if replace(&mut s.priority, priority) {
                s.changes.push(TransferEvent::PriorityChanged(priority));
            }
        });
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.read(|s| s.status)
    }

    /// Status as display text, including the error for failures.
    #[must_use]
    pub fn status_string(&self) -> String {
        self.read(State::status_string)
    }

    /// Error text of the last failure or cancellation.
    #[must_use]
    pub fn error_string(&self) -> String {
        self.read(|s| s.error_string.clone())
    }

    /// Direction.
    #[must_use]
    pub fn transfer_type(&self) -> TransferType {
        self.read(|s| s.transfer_type)
    }

    /// Set the direction.
    pub fn set_transfer_type(&self, transfer_type: TransferType) {
        self.mutate(|s| {
            if replace(&mut s.transfer_type, transfer_type) {
                s.changes
                    .push(TransferEvent::TransferTypeChanged(transfer_type));
            }
        });
    }

    /// Format the finished file is converted to, if any.
    #[must_use]
    pub fn conversion_format(&self) -> Option<AudioFormat> {
        self.read(|s| s.conversion_format)
    }

    /// Set the conversion target.
    pub fn set_conversion_format(&self, format: Option<AudioFormat>) {
        self.mutate(|s| {
            if replace(&mut s.conversion_format, format) {
                s.changes
                    .push(TransferEvent::ConversionFormatChanged(format));
            }
        });
    }

    /// Path of the finished (and possibly converted) file.
    #[must_use]
    pub fn output_path(&self) -> Option<PathBuf> {
        self.read(|s| s.output_path.clone())
    }

    /// Where the partial file for this transfer lives.
    #[must_use]
    pub fn partial_path(&self) -> PathBuf {
        self.read(|s| {
            sink::partial_path(
                &s.incomplete_directory(&self.inner.context),
                &s.id,
                &s.file_name,
            )
        })
    }

    /// Copy of all attributes.
    #[must_use]
    pub fn snapshot(&self) -> TransferSnapshot {
        self.read(State::snapshot)
    }

    // --- Listeners --------------------------------------------------------

    /// Register a change listener.
    pub fn subscribe(
        &self,
        listener: impl Fn(&Self, &TransferEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let listener: Listener = Arc::new(listener);
        self.inner.dispatcher.subscribe(listener)
    }

    /// Remove a change listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Receiver that always holds the current status.
    #[must_use]
    pub fn status_receiver(&self) -> watch::Receiver<TransferStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Wait until the transfer reaches a terminal status.
    pub async fn wait_until_finished(&self) -> TransferStatus {
        let mut rx = self.status_receiver();
        match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        }
    }

    // --- Commands ---------------------------------------------------------

    /// Mark the transfer as waiting for a slot. Does no I/O.
    pub fn queue(&self) -> bool {
        let queued = self.mutate(|s| {
            if s.status.is_active() || s.status == TransferStatus::Queued {
                return false;
            }
            s.set_status(TransferStatus::Queued, None);
            true
        });
        if queued {
            debug!("Transfer {} queued", self.id());
        }
        queued
    }

    /// Begin (or resume) the transfer from `Queued` or `Paused`.
    ///
    /// Returns `false` when the transfer was not startable. Must be called
    /// from within a Tokio runtime.
    pub fn start(&self) -> bool {
        self.begin(|status| matches!(status, TransferStatus::Queued | TransferStatus::Paused))
    }

    /// Start only if still `Queued`. Used by the scheduler on admission.
    pub(crate) fn start_queued(&self) -> bool {
        self.begin(|status| status == TransferStatus::Queued)
    }

    fn begin(&self, startable: impl FnOnce(TransferStatus) -> bool) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Transfer {} cannot start outside a Tokio runtime", self.id());
            return false;
        };

        let run = self.mutate(|s| {
            if !startable(s.status) {
                return None;
            }
            s.generation += 1;
            let token = CancellationToken::new();
            if let Some(previous) = s.cancel.replace(token.clone()) {
                previous.cancel();
            }
            s.output_path = None;
            s.set_status(TransferStatus::Connecting, None);
            Some(Run {
                transfer: self.clone(),
                generation: s.generation,
                token,
                inputs: RunInputs::from_state(s),
            })
        });

        match run {
            Some(run) => {
                info!("Starting transfer {}", run.inputs.id);
                runtime.spawn(run.execute());
                true
            }
            None => false,
        }
    }

    /// Stop a running transfer, keeping the partial file.
    ///
    /// Resolves once the controller task has let go of the file.
    pub async fn pause(&self) {
        let paused = self.mutate(|s| {
            if !s.status.is_pausable() {
                return false;
            }
            s.generation += 1;
            if let Some(token) = s.cancel.take() {
                token.cancel();
            }
            s.set_status(TransferStatus::Paused, None);
            true
        });
        if paused {
            info!("Transfer {} paused", self.id());
            self.join().await;
        }
    }

    /// Stop the transfer for good and delete its partial file.
    pub async fn cancel(&self) {
        let canceled = self.mutate(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.generation += 1;
            if let Some(token) = s.cancel.take() {
                token.cancel();
            }
            s.set_status(TransferStatus::Canceled, Some(CANCELED_BY_USER));
            true
        });
        if !canceled {
            return;
        }

        info!("Transfer {} canceled", self.id());
        self.join().await;
        let partial = self.partial_path();
        if let Err(e) = sink::remove_partial(&partial).await {
            warn!("Failed to remove partial file {}: {}", partial.display(), e);
        }
    }

    /// Wait for the current controller task, if any, to exit.
    async fn join(&self) {
        let _idle = self.inner.run_lock.lock().await;
    }
}

impl PartialEq for Transfer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Transfer {}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.read(|s| {
            f.debug_struct("Transfer")
                .field("id", &s.id)
                .field("status", &s.status)
                .field("bytes_transferred", &s.bytes_transferred)
                .field("size", &s.size)
                .finish_non_exhaustive()
        })
    }
}

/// Sanitize a string for use as a file name.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let invalid_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|', '\0'];

    let sanitized: String = name
        .chars()
        .map(|c| {
            if invalid_chars.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Leave room for an extension and a " (n)" suffix.
    sanitized
        .trim()
        .trim_matches('.')
        .chars()
        .take(200)
        .collect::<String>()
        .trim_end()
        .to_string()
}

/// `file_name` with `.ext` appended unless it already ends with it.
fn final_file_name(file_name: &str, ext: &str) -> String {
    let ext = ext.trim_start_matches('.');
    let lower = file_name.to_ascii_lowercase();
    if ext.is_empty() || lower.ends_with(&format!(".{}", ext.to_ascii_lowercase())) {
        file_name.to_string()
    } else {
        format!("{file_name}.{ext}")
    }
}

// --- Controller -----------------------------------------------------------

/// Inputs captured when a run starts.
#[derive(Debug, Clone)]
struct RunInputs {
    id: String,
    resource_id: String,
    service: String,
    url: String,
    stream_id: String,
    stream_url: String,
    title: String,
    file_name: String,
    file_extension: String,
    download_path: PathBuf,
    transfer_type: TransferType,
    conversion_format: Option<AudioFormat>,
}

impl RunInputs {
    fn from_state(s: &State) -> Self {
        Self {
            id: s.id.clone(),
            resource_id: s.resource_id.clone(),
            service: s.service.clone(),
            url: s.url.clone(),
            stream_id: s.stream_id.clone(),
            stream_url: s.stream_url.clone(),
            title: s.title.clone(),
            file_name: s.file_name.clone(),
            file_extension: s.file_extension.clone(),
            download_path: s.download_path.clone(),
            transfer_type: s.transfer_type,
            conversion_format: s.conversion_format,
        }
    }
}

/// Why a run stopped early.
#[derive(Debug)]
enum Halt {
    /// Paused, canceled or superseded; status is already set.
    Interrupted,
    Failed(TransferError),
}

impl From<TransferError> for Halt {
    fn from(error: TransferError) -> Self {
        Self::Failed(error)
    }
}

impl From<crate::error::Error> for Halt {
    fn from(error: crate::error::Error) -> Self {
        Self::Failed(error.into())
    }
}

/// How one download exchange ended.
enum Exchange {
    Redirect(String),
    RangeRefused,
    Finished(FileSink),
}

/// One controller task.
struct Run {
    transfer: Transfer,
    generation: u64,
    token: CancellationToken,
    inputs: RunInputs,
}

impl Run {
    async fn execute(mut self) {
        let inner = Arc::clone(&self.transfer.inner);
        let _running = inner.run_lock.lock().await;
        if self.token.is_cancelled() {
            debug!("Run {} of transfer {} superseded", self.generation, self.inputs.id);
            return;
        }

        let result = match self.inputs.transfer_type {
            TransferType::Download => self.download().await,
            TransferType::Upload => self.upload().await,
        };

        if let Err(Halt::Failed(error)) = result {
            warn!("Transfer {} failed: {}", self.inputs.id, error);
            let message = error.to_string();
            self.transfer.mutate_run(self.generation, |s| {
                s.set_status(TransferStatus::Failed, Some(&message));
            });
        }
    }

    fn context(&self) -> &TransferContext {
        &self.transfer.inner.context
    }

    fn update(&self, f: impl FnOnce(&mut State)) -> Result<(), Halt> {
        if self.transfer.mutate_run(self.generation, f) {
            Ok(())
        } else {
            Err(Halt::Interrupted)
        }
    }

    async fn interruptible<F: Future>(&self, future: F) -> Result<F::Output, Halt> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Halt::Interrupted),
            output = future => Ok(output),
        }
    }

    async fn download(&mut self) -> Result<(), Halt> {
        if self.inputs.url.is_empty() {
            self.resolve().await?;
        }
        self.ensure_file_name()?;

        let partial = self.transfer.partial_path();
        let validator = sink::load_validator(&partial).await;
        let mut offset = match validator {
            Some(_) => sink::current_size(&partial).await,
            None => 0,
        };
        if offset > 0 {
            info!("Resuming transfer {} from byte {}", self.inputs.id, offset);
        }
        self.update(|s| s.set_bytes(offset))?;

        let limit = self.context().max_redirects;
        let mut url = self.inputs.url.clone();
        let mut redirects = 0u32;
        let mut fell_back = false;

        let finished = loop {
            let request = FetchRequest::new(url.clone())
                .with_range_start(offset)
                .with_validator(if offset > 0 { validator.clone() } else { None });
            let mut handle = self.context().fetcher.fetch(request);

            match self.receive(&mut handle, &partial, offset).await? {
                Exchange::Finished(open) => break open,
                Exchange::Redirect(target) => {
                    redirects += 1;
                    if redirects > limit {
                        return Err(TransferError::RedirectLimitExceeded { limit }.into());
                    }
                    debug!(
                        "Transfer {} redirected ({}/{}) to {}",
                        self.inputs.id, redirects, limit, target
                    );
                    url = target;
                }
                Exchange::RangeRefused => {
                    if fell_back || offset == 0 {
                        return Err(TransferError::RangeNotSupported { offset }.into());
                    }
                    warn!(
                        "Transfer {} cannot resume from byte {}, restarting",
                        self.inputs.id, offset
                    );
                    fell_back = true;
                    sink::remove_partial(&partial).await?;
                    offset = 0;
                    self.update(|s| s.set_bytes(0))?;
                }
            }
        };

        self.finish(finished).await
    }

    async fn resolve(&mut self) -> Result<(), Halt> {
        let resolver = self.context().resolver.clone();
        let candidate = match resolver {
            Some(resolver) => {
                let query = StreamQuery {
                    service: self.inputs.service.clone(),
                    resource_id: self.inputs.resource_id.clone(),
                    stream_id: self.inputs.stream_id.clone(),
                    stream_url: self.inputs.stream_url.clone(),
                };
                debug!("Resolving stream for transfer {}", self.inputs.id);
                let candidates = self.interruptible(resolver.list_streams(&query)).await??;
                candidates.into_iter().next().ok_or_else(|| {
                    TransferError::Resolution(format!(
                        "No streams found for '{}'",
                        self.inputs.resource_id
                    ))
                })?
            }
            None if !self.inputs.stream_url.is_empty() => {
                StreamCandidate::new(self.inputs.stream_url.clone())
            }
            None => {
                return Err(TransferError::Resolution(format!(
                    "No URL for transfer '{}'",
                    self.inputs.id
                ))
                .into());
            }
        };

        info!("Transfer {} resolved to {}", self.inputs.id, candidate.url);
        self.inputs.url = candidate.url.clone();
        if self.inputs.file_name.is_empty()
            && let Some(name) = &candidate.suggested_file_name
        {
            self.inputs.file_name = sanitize_filename(name);
        }
        if self.inputs.file_extension.is_empty()
            && let Some(ext) = &candidate.file_extension
        {
            self.inputs.file_extension = ext.clone();
        }

        let inputs = self.inputs.clone();
        self.update(|s| {
            s.set_url(candidate.url);
            if candidate.size.is_some() {
                s.set_size(candidate.size);
            }
            s.set_file_name(inputs.file_name);
            s.set_file_extension(inputs.file_extension);
        })
    }

    fn ensure_file_name(&mut self) -> Result<(), Halt> {
        if !self.inputs.file_name.is_empty() {
            return Ok(());
        }
        let name = [&self.inputs.title, &self.inputs.resource_id, &self.inputs.id]
            .into_iter()
            .map(|candidate| sanitize_filename(candidate.as_str()))
            .find(|name| !name.is_empty())
            .unwrap_or_else(|| "download".to_string());
        self.inputs.file_name = name.clone();
        self.update(|s| s.set_file_name(name))
    }

    /// Drive one exchange, closing the partial file if it stops early.
    async fn receive(
        &self,
        handle: &mut FetchHandle,
        partial: &Path,
        offset: u64,
    ) -> Result<Exchange, Halt> {
        let mut open = None;
        let result = self.receive_events(handle, partial, offset, &mut open).await;
        if let Some(open) = open {
            self.release(open, matches!(result, Err(Halt::Interrupted))).await;
        }
        result
    }

    /// Close the partial file, or delete it when the run was canceled.
    async fn release(&self, file: FileSink, interrupted: bool) {
        let path = file.path().to_path_buf();
        let result = if interrupted && self.transfer.status() == TransferStatus::Canceled {
            file.discard().await
        } else {
            file.close().await
        };
        if let Err(e) = result {
            warn!("Failed to release {}: {}", path.display(), e);
        }
    }

    async fn receive_events(
        &self,
        handle: &mut FetchHandle,
        partial: &Path,
        offset: u64,
        open: &mut Option<FileSink>,
    ) -> Result<Exchange, Halt> {
        loop {
            let event = self.interruptible(handle.next_event()).await?;
            match event {
                Some(FetchEvent::Headers(head)) => {
                    let append = head.resumed && offset > 0;
                    let file = FileSink::open(partial, append).await?;
                    if !append {
                        let validator = ResumeValidator::from_head(&head);
                        if let Err(e) = sink::store_validator(partial, &validator).await {
                            warn!("Transfer {} will not be resumable: {}", self.inputs.id, e);
                        }
                    }
                    let written = file.current_size();
                    *open = Some(file);
                    self.update(|s| {
                        if head.total_size.is_some() {
                            s.set_size(head.total_size);
                        }
                        s.set_bytes(written);
                        s.set_status(TransferStatus::Downloading, None);
                    })?;
                }
                Some(FetchEvent::Data(chunk)) => {
                    let Some(file) = open.as_mut() else {
                        return Err(TransferError::Network(
                            "Received data before response headers".to_string(),
                        )
                        .into());
                    };
                    file.write(&chunk).await?;
                    let written = file.current_size();
                    self.update(|s| s.set_bytes(written))?;
                }
                Some(FetchEvent::Completed) => {
                    let Some(file) = open.take() else {
                        return Err(TransferError::Network(
                            "Response ended before headers".to_string(),
                        )
                        .into());
                    };
                    let written = file.current_size();
                    let expected = self.transfer.size();
                    if let Some(expected) = expected
                        && written < expected
                    {
                        *open = Some(file);
                        return Err(TransferError::Network(format!(
                            "Connection closed after {written} of {expected} bytes"
                        ))
                        .into());
                    }
                    return Ok(Exchange::Finished(file));
                }
                Some(FetchEvent::Redirect(target)) if open.is_none() => {
                    return Ok(Exchange::Redirect(target));
                }
                Some(FetchEvent::RangeNotSupported) if open.is_none() => {
                    return Ok(Exchange::RangeRefused);
                }
                Some(FetchEvent::Redirect(_) | FetchEvent::RangeNotSupported) => {
                    return Err(TransferError::Network(
                        "Unexpected response after the body started".to_string(),
                    )
                    .into());
                }
                Some(FetchEvent::Failed(reason)) => {
                    return Err(TransferError::Network(reason).into());
                }
                Some(FetchEvent::Sent(_)) => {}
                None => {
                    return Err(
                        TransferError::Network("Connection closed unexpectedly".to_string()).into(),
                    );
                }
            }
        }
    }

    async fn finish(&self, file: FileSink) -> Result<(), Halt> {
        if self.token.is_cancelled() {
            self.release(file, true).await;
            return Err(Halt::Interrupted);
        }

        let name = final_file_name(&self.inputs.file_name, &self.inputs.file_extension);
        let dest = sink::unique_destination(&self.inputs.download_path, &name).await;
        let mut placed = file.finalize(&dest).await?;

        let result = self.complete(&mut placed).await;
        if matches!(result, Err(Halt::Interrupted)) {
            // Paused or canceled after the move: the file is not a result.
            info!("Transfer {} interrupted, removing {}", self.inputs.id, placed.display());
            if let Err(e) = tokio::fs::remove_file(&placed).await {
                warn!("Failed to remove {}: {}", placed.display(), e);
            }
        }
        result
    }

    /// Record the placed file, convert it if asked, and complete.
    /// `placed` always names the file this run currently owns.
    async fn complete(&self, placed: &mut PathBuf) -> Result<(), Halt> {
        let output = placed.clone();
        self.update(|s| {
            s.output_path = Some(output);
            if s.size.is_none() {
                s.set_progress(100);
            }
        })?;

        if let Some(format) = self.inputs.conversion_format {
            let source = placed.clone();
            let converted = self.convert(&source, format).await?;
            if converted != source {
                *placed = converted.clone();
                if let Err(e) = tokio::fs::remove_file(&source).await {
                    warn!("Failed to remove {} after conversion: {}", source.display(), e);
                }
            }
            self.update(|s| {
                s.output_path = Some(converted);
                s.set_file_extension(format.extension().to_string());
            })?;
        }

        self.update(|s| s.set_status(TransferStatus::Completed, None))?;
        info!("Transfer {} completed", self.inputs.id);
        Ok(())
    }

    async fn convert(&self, source: &Path, format: AudioFormat) -> Result<PathBuf, Halt> {
        let Some(processor) = self.context().post_processor.clone() else {
            return Err(TransferError::Conversion(format!(
                "No converter available for {format}"
            ))
            .into());
        };

        self.update(|s| s.set_status(TransferStatus::Converting, None))?;
        info!("Converting {} to {}", source.display(), format);
        self.interruptible(processor.convert(source, format))
            .await?
            .map_err(Halt::from)
    }

    async fn upload(&mut self) -> Result<(), Halt> {
        if self.inputs.url.is_empty() {
            return Err(TransferError::Resolution(format!(
                "No destination URL for upload '{}'",
                self.inputs.id
            ))
            .into());
        }

        let name = final_file_name(&self.inputs.file_name, &self.inputs.file_extension);
        let path = self.inputs.download_path.join(name);
        let size = tokio::fs::metadata(&path)
            .await
            .map_err(|e| TransferError::Io(format!("Failed to read {}: {e}", path.display())))?
            .len();
        self.update(|s| {
            s.set_size(Some(size));
            s.set_bytes(0);
        })?;

        let limit = self.context().max_redirects;
        let mut url = self.inputs.url.clone();
        let mut redirects = 0u32;

        'exchange: loop {
            let mut handle = self.context().fetcher.upload(UploadRequest {
                url: url.clone(),
                path: path.clone(),
                method: self.context().upload_method,
                headers: Vec::new(),
            });

            loop {
                match self.interruptible(handle.next_event()).await? {
                    Some(FetchEvent::Sent(sent)) => {
                        self.update(|s| {
                            s.set_status(TransferStatus::Uploading, None);
                            s.set_bytes(sent.min(size));
                        })?;
                    }
                    Some(FetchEvent::Headers(_)) => {
                        self.update(|s| s.set_status(TransferStatus::Uploading, None))?;
                    }
                    Some(FetchEvent::Completed) => break 'exchange,
                    Some(FetchEvent::Redirect(target)) => {
                        redirects += 1;
                        if redirects > limit {
                            return Err(TransferError::RedirectLimitExceeded { limit }.into());
                        }
                        url = target;
                        self.update(|s| s.set_bytes(0))?;
                        continue 'exchange;
                    }
                    Some(FetchEvent::Failed(reason)) => {
                        return Err(TransferError::Network(reason).into());
                    }
                    Some(FetchEvent::Data(_) | FetchEvent::RangeNotSupported) => {}
                    None => {
                        return Err(TransferError::Network(
                            "Connection closed unexpectedly".to_string(),
                        )
                        .into());
                    }
                }
            }
        }

        self.update(|s| {
            s.set_bytes(size);
            s.set_progress(100);
            s.output_path = Some(path.clone());
            s.set_status(TransferStatus::Completed, None);
        })?;
        info!("Transfer {} uploaded {} bytes", self.inputs.id, size);
        Ok(())
    }
}
