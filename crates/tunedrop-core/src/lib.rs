//! `Tunedrop` Core Library
//!
//! This crate provides the transfer engine behind `Tunedrop`:
//! - Resumable HTTP downloads and uploads with bounded redirect following
//! - A per-transfer state machine with ordered change notifications
//! - Priority scheduling under a concurrency limit
//! - Stream resolution and audio post-processing through pluggable traits
//! - Engine configuration management
//!
//! # Error Handling
//!
//! Library operations return [`Result`]. Failures during a running transfer
//! are captured as a [`TransferError`] and surfaced through the transfer's
//! `status` and `error_string` instead of being propagated.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tunedrop_core::{FetchConfig, HttpFetcher, Transfer, TransferContext, TransferScheduler};
//!
//! let fetcher = Arc::new(HttpFetcher::new(FetchConfig::default())?);
//! let scheduler = TransferScheduler::new();
//!
//! let transfer = Transfer::new(TransferContext::new(fetcher));
//! transfer.set_url("https://example.com/track.ogg");
//! transfer.set_download_path("/music");
//! scheduler.attach(&transfer);
//! transfer.queue();
//! transfer.wait_until_finished().await;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod config;
pub mod convert;
pub mod error;
pub mod events;
pub mod fetch;
pub mod resolver;
pub mod scheduler;
pub mod sink;
pub mod transfer;

pub use config::{EngineConfig, INCOMPLETE_DIR_NAME, default_download_directory};
pub use convert::{AudioFormat, AudioQuality, ConversionConfig, FfmpegConverter, PostProcessor};
pub use error::{Error, FileSystemError, Result, TransferError};
pub use events::{Listener, ListenerId, LogNotifier, StatusNotifier, TransferEvent};
pub use fetch::{
    DEFAULT_MAX_REDIRECTS, FetchConfig, FetchEvent, FetchHandle, FetchRequest, Fetcher,
    HttpFetcher, ResponseHead, ResumeValidator, UploadMethod, UploadRequest,
};
pub use resolver::{DirectUrlResolver, StreamCandidate, StreamQuery, StreamResolver};
pub use scheduler::{
    DEFAULT_MAX_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS, MIN_CONCURRENT_TRANSFERS,
    SchedulerConfig, SchedulerEvent, SchedulerStats, TransferScheduler,
};
pub use sink::FileSink;
pub use transfer::{
    CANCELED_BY_USER, Transfer, TransferContext, TransferPriority, TransferSnapshot,
    TransferStatus, TransferType, sanitize_filename,
};

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
