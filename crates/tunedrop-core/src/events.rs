//! Change notifications for transfers.
//!
//! Every attribute mutation on a [`Transfer`] produces a [`TransferEvent`].
//! Listeners are plain callbacks; any number may be registered, and they are
//! invoked in the exact order the mutations happened, even when a listener
//! reacts by calling back into the transfer (the scheduler does this when it
//! admits the next queued transfer).

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::convert::AudioFormat;
use crate::lock;
use crate::transfer::{Transfer, TransferPriority, TransferSnapshot, TransferStatus, TransferType};

/// A change to one attribute of a transfer, carrying the new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum TransferEvent {
    /// `id` changed.
    IdChanged(String),
    /// `category` changed.
    CategoryChanged(String),
    /// `download_path` changed.
    DownloadPathChanged(PathBuf),
    /// `file_name` changed.
    FileNameChanged(String),
    /// `file_extension` changed.
    FileExtensionChanged(String),
    /// `priority` (and therefore `priority_string`) changed.
    PriorityChanged(TransferPriority),
    /// `bytes_transferred` and/or `progress` changed.
    ProgressChanged {
        /// Bytes transferred so far.
        bytes_transferred: u64,
        /// Percentage, 0-100.
        progress: u8,
    },
    /// `resource_id` changed.
    ResourceIdChanged(String),
    /// `service` was set.
    ServiceChanged(String),
    /// `size` changed.
    SizeChanged(Option<u64>),
    /// `status` (and therefore `status_string`) changed.
    StatusChanged {
        /// New status.
        status: TransferStatus,
        /// Error text for `Failed`/`Canceled`.
        error: Option<String>,
    },
    /// `stream_id` changed.
    StreamIdChanged(String),
    /// `stream_url` changed.
    StreamUrlChanged(String),
    /// `title` changed.
    TitleChanged(String),
    /// `transfer_type` changed.
    TransferTypeChanged(TransferType),
    /// `url` changed.
    UrlChanged(String),
    /// Post-processing target changed.
    ConversionFormatChanged(Option<AudioFormat>),
}

/// Callback invoked for every event of a transfer.
pub type Listener = Arc<dyn Fn(&Transfer, &TransferEvent) + Send + Sync>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Optional side channel told about every status change, e.g. a desktop
/// notification area. Not part of the transfer's state.
pub trait StatusNotifier: Send + Sync {
    /// Called after the transfer's status changed.
    fn status_changed(&self, snapshot: &TransferSnapshot);
}

/// [`StatusNotifier`] that writes status changes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl StatusNotifier for LogNotifier {
    fn status_changed(&self, snapshot: &TransferSnapshot) {
        info!(
            "[{}] {} - {}",
            snapshot.id,
            snapshot.title_or_file_name(),
            snapshot.status_string
        );
    }
}

/// Ordered, re-entrancy safe delivery of events to listeners.
pub(crate) struct Dispatcher {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    pending: Mutex<VecDeque<TransferEvent>>,
    dispatching: AtomicBool,
    next_id: AtomicU64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            dispatching: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Queue events. Callers hold the transfer's state lock while enqueueing
    /// so queue order is mutation order.
    pub(crate) fn enqueue(&self, events: impl IntoIterator<Item = TransferEvent>) {
        lock(&self.pending).extend(events);
    }

    /// Deliver queued events unless another call is already delivering them.
    /// Must be called without the transfer's state lock held.
    pub(crate) fn dispatch(&self, transfer: &Transfer) {
        loop {
            if self
                .dispatching
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = lock(&self.pending).pop_front();
                let Some(event) = next else {
                    break;
                };
                let listeners: Vec<Listener> = lock(&self.listeners)
                    .iter()
                    .map(|(_, l)| Arc::clone(l))
                    .collect();
                for listener in listeners {
                    listener(transfer, &event);
                }
            }

            self.dispatching.store(false, Ordering::Release);

            // An event queued between the last pop and the store above would
            // otherwise wait for the next mutation.
            if lock(&self.pending).is_empty() {
                return;
            }
        }
    }
}
