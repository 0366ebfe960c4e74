//! Bounded-concurrency admission of queued transfers.
//!
//! The scheduler keeps a waiting list and an active set. Queued transfers are
//! admitted highest priority first, and in submission order within a
//! priority, whenever the active set has room. Attached transfers drive the
//! scheduler themselves through a status listener:
//! - `Queued` submits the transfer;
//! - `Paused` or a terminal status releases its slot and admits the next one.
//!
//! ```rust,ignore
//! let scheduler = TransferScheduler::with_config(SchedulerConfig { max_concurrent_transfers: 2 });
//! for transfer in &transfers {
//!     scheduler.attach(transfer);
//!     transfer.queue();
//! }
//! ```

use std::cmp::Reverse;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{ListenerId, TransferEvent};
use crate::lock;
use crate::transfer::{Transfer, TransferPriority, TransferStatus};

/// Default number of transfers running at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 2;

/// Minimum allowed concurrent transfers.
pub const MIN_CONCURRENT_TRANSFERS: usize = 1;

/// Maximum allowed concurrent transfers.
pub const MAX_CONCURRENT_TRANSFERS: usize = 8;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of active transfers.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
}

const fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT_TRANSFERS
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: DEFAULT_MAX_CONCURRENT_TRANSFERS,
        }
    }
}

impl SchedulerConfig {
    /// Validate and clamp the `max_concurrent_transfers` value.
    pub fn validate(&mut self) {
        self.max_concurrent_transfers = self
            .max_concurrent_transfers
            .clamp(MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS);
    }
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SchedulerEvent {
    /// A transfer joined the waiting list.
    Submitted {
        /// Transfer id.
        id: String,
    },
    /// A transfer was given a slot and started.
    Admitted {
        /// Transfer id.
        id: String,
    },
    /// A transfer left the waiting list or gave its slot back.
    Released {
        /// Transfer id.
        id: String,
        /// Status that caused the release.
        status: TransferStatus,
    },
    /// A transfer was removed from the scheduler.
    Removed {
        /// Transfer id.
        id: String,
    },
    /// Admission was paused.
    Paused,
    /// Admission was resumed.
    Resumed,
    /// Configuration changed.
    ConfigUpdated(SchedulerConfig),
}

/// Transfer counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    /// Transfers known to the scheduler.
    pub total: usize,
    /// Waiting for a slot.
    pub queued: usize,
    /// Holding a slot.
    pub active: usize,
    /// Paused or not yet queued.
    pub paused: usize,
    /// Finished successfully.
    pub completed: usize,
    /// Failed.
    pub failed: usize,
    /// Canceled.
    pub canceled: usize,
}

struct Waiting {
    transfer: Transfer,
    priority: TransferPriority,
    seq: u64,
}

struct Entry {
    transfer: Transfer,
    listener: Option<ListenerId>,
}

struct SchedulerState {
    config: SchedulerConfig,
    paused: bool,
    next_seq: u64,
    entries: Vec<Entry>,
    waiting: Vec<Waiting>,
    active: Vec<Transfer>,
}

impl SchedulerState {
    fn is_known(&self, transfer: &Transfer) -> bool {
        self.entries.iter().any(|e| &e.transfer == transfer)
    }

    fn is_waiting(&self, transfer: &Transfer) -> bool {
        self.waiting.iter().any(|w| &w.transfer == transfer)
    }

    fn is_active(&self, transfer: &Transfer) -> bool {
        self.active.iter().any(|t| t == transfer)
    }

    /// Pop the next transfer to admit, if a slot is free.
    fn take_next(&mut self) -> Option<Transfer> {
        if self.paused || self.active.len() >= self.config.max_concurrent_transfers {
            return None;
        }
        // Highest priority first, then lowest sequence number (FIFO).
        let index = self
            .waiting
            .iter()
            .enumerate()
            .min_by_key(|(_, w)| (Reverse(w.priority), w.seq))
            .map(|(i, _)| i)?;
        let next = self.waiting.remove(index).transfer;
        self.active.push(next.clone());
        Some(next)
    }
}

struct Shared {
    state: Mutex<SchedulerState>,
    event_tx: mpsc::UnboundedSender<SchedulerEvent>,
}

impl Shared {
    fn emit(&self, event: SchedulerEvent) {
        let _ = self.event_tx.send(event);
    }

    fn submit(&self, transfer: &Transfer) -> bool {
        if transfer.status() != TransferStatus::Queued {
            debug!(
                "Not submitting transfer {} in status {}",
                transfer.id(),
                transfer.status()
            );
            return false;
        }

        let priority = transfer.priority();
        let submitted = {
            let mut state = lock(&self.state);
            if state.is_waiting(transfer) || state.is_active(transfer) {
                false
            } else {
                if !state.is_known(transfer) {
                    state.entries.push(Entry {
                        transfer: transfer.clone(),
                        listener: None,
                    });
                }
                let seq = state.next_seq;
                state.next_seq += 1;
                state.waiting.push(Waiting {
                    transfer: transfer.clone(),
                    priority,
                    seq,
                });
                true
            }
        };

        if submitted {
            let id = transfer.id();
            debug!("Transfer {} waiting for a slot", id);
            self.emit(SchedulerEvent::Submitted { id });
        }
        self.pump();
        submitted
    }

    fn on_status(&self, transfer: &Transfer, status: TransferStatus) {
        match status {
            TransferStatus::Queued => {
                self.submit(transfer);
            }
            s if s.is_active() => {
                let mut state = lock(&self.state);
                if !state.is_active(transfer) {
                    // Started outside admission; still counts against the limit.
                    state.waiting.retain(|w| &w.transfer != transfer);
                    state.active.push(transfer.clone());
                }
            }
            _ => self.release(transfer, status),
        }
    }

    fn release(&self, transfer: &Transfer, status: TransferStatus) {
        let released = {
            let mut state = lock(&self.state);
            let before = state.waiting.len() + state.active.len();
            state.waiting.retain(|w| &w.transfer != transfer);
            state.active.retain(|t| t != transfer);
            before != state.waiting.len() + state.active.len()
        };

        if released {
            let id = transfer.id();
            debug!("Transfer {} released ({})", id, status);
            self.emit(SchedulerEvent::Released { id, status });
        }
        self.pump();
    }

    fn reprioritize(&self, transfer: &Transfer, priority: TransferPriority) {
        let mut state = lock(&self.state);
        if let Some(waiting) = state.waiting.iter_mut().find(|w| &w.transfer == transfer) {
            waiting.priority = priority;
        }
    }

    /// Admit waiting transfers while there is room.
    ///
    /// The admission decision is made under the lock; `start` runs after it
    /// is released because it re-enters the scheduler through listeners.
    fn pump(&self) {
        loop {
            let Some(next) = lock(&self.state).take_next() else {
                return;
            };

            let id = next.id();
            if next.start_queued() {
                info!("Admitted transfer {}", id);
                self.emit(SchedulerEvent::Admitted { id });
            } else {
                warn!("Transfer {} was no longer startable", id);
                lock(&self.state).active.retain(|t| t != &next);
            }
        }
    }
}

/// Admits queued transfers under a concurrency limit.
pub struct TransferScheduler {
    shared: Arc<Shared>,
    event_rx: Mutex<mpsc::UnboundedReceiver<SchedulerEvent>>,
}

impl TransferScheduler {
    /// Create a scheduler with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    /// Create a scheduler with custom configuration.
    #[must_use]
    pub fn with_config(mut config: SchedulerConfig) -> Self {
        config.validate();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState {
                    config,
                    paused: false,
                    next_seq: 0,
                    entries: Vec::new(),
                    waiting: Vec::new(),
                    active: Vec::new(),
                }),
                event_tx,
            }),
            event_rx: Mutex::new(event_rx),
        }
    }

    /// Manage `transfer`: its status changes now submit and release it.
    ///
    /// Attaching the same transfer twice has no effect.
    pub fn attach(&self, transfer: &Transfer) {
        {
            let state = lock(&self.shared.state);
            if state
                .entries
                .iter()
                .any(|e| &e.transfer == transfer && e.listener.is_some())
            {
                return;
            }
        }

        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let listener = transfer.subscribe(move |transfer, event| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match event {
                TransferEvent::StatusChanged { status, .. } => shared.on_status(transfer, *status),
                TransferEvent::PriorityChanged(priority) => {
                    shared.reprioritize(transfer, *priority);
                }
                _ => {}
            }
        });

        {
            let mut state = lock(&self.shared.state);
            match state.entries.iter_mut().find(|e| &e.transfer == transfer) {
                Some(entry) => entry.listener = Some(listener),
                None => state.entries.push(Entry {
                    transfer: transfer.clone(),
                    listener: Some(listener),
                }),
            }
        }
        debug!("Attached transfer {}", transfer.id());

        if transfer.status() == TransferStatus::Queued {
            self.shared.submit(transfer);
        }
    }

    /// Add a queued transfer to the waiting list and admit what fits.
    ///
    /// Returns `false` if the transfer is not `Queued` or already scheduled.
    pub fn submit(&self, transfer: &Transfer) -> bool {
        self.shared.submit(transfer)
    }

    /// Re-evaluate `transfer` after a status change it made without a listener.
    pub fn notify_status_changed(&self, transfer: &Transfer) {
        self.shared.on_status(transfer, transfer.status());
    }

    /// Stop admitting transfers. Active transfers keep running.
    pub fn pause(&self) {
        let changed = {
            let mut state = lock(&self.shared.state);
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            self.shared.emit(SchedulerEvent::Paused);
            info!("Scheduler paused");
        }
    }

    /// Resume admission.
    pub fn resume(&self) {
        let changed = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            self.shared.emit(SchedulerEvent::Resumed);
            info!("Scheduler resumed");
        }
        self.shared.pump();
    }

    /// Whether admission is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        lock(&self.shared.state).paused
    }

    /// Current configuration.
    #[must_use]
    pub fn config(&self) -> SchedulerConfig {
        lock(&self.shared.state).config.clone()
    }

    /// Update the concurrency limit and admit what now fits.
    ///
    /// Lowering the limit never stops running transfers.
    pub fn set_max_concurrent(&self, max: usize) {
        let config = {
            let mut state = lock(&self.shared.state);
            state.config.max_concurrent_transfers =
                max.clamp(MIN_CONCURRENT_TRANSFERS, MAX_CONCURRENT_TRANSFERS);
            state.config.clone()
        };
        info!(
            "Max concurrent transfers set to {}",
            config.max_concurrent_transfers
        );
        self.shared.emit(SchedulerEvent::ConfigUpdated(config));
        self.shared.pump();
    }

    /// Forget an inactive transfer.
    pub fn remove(&self, id: &str) -> bool {
        let transfers = self.transfers();
        let Some(transfer) = transfers.into_iter().find(|t| t.id() == id) else {
            warn!("Cannot remove transfer {} - not found", id);
            return false;
        };
        if transfer.status().is_active() {
            warn!("Cannot remove transfer {} while it is running", id);
            return false;
        }

        let entry = {
            let mut state = lock(&self.shared.state);
            state.waiting.retain(|w| w.transfer != transfer);
            state.active.retain(|t| t != &transfer);
            let index = state.entries.iter().position(|e| e.transfer == transfer);
            index.map(|i| state.entries.remove(i))
        };
        let Some(entry) = entry else {
            return false;
        };

        if let Some(listener) = entry.listener {
            entry.transfer.unsubscribe(listener);
        }
        self.shared.emit(SchedulerEvent::Removed { id: id.to_string() });
        info!("Removed transfer {}", id);
        true
    }

    /// Forget all transfers in a terminal status. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let finished: Vec<Transfer> = self
            .transfers()
            .into_iter()
            .filter(|t| t.status().is_terminal())
            .collect();

        let removed: Vec<Entry> = {
            let mut state = lock(&self.shared.state);
            let (gone, kept): (Vec<Entry>, Vec<Entry>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| finished.contains(&e.transfer));
            state.entries = kept;
            state.waiting.retain(|w| !finished.contains(&w.transfer));
            gone
        };

        for entry in &removed {
            if let Some(listener) = entry.listener {
                entry.transfer.unsubscribe(listener);
            }
        }
        if !removed.is_empty() {
            info!("Cleared {} finished transfers", removed.len());
        }
        removed.len()
    }

    /// All transfers known to the scheduler, in the order they were added.
    #[must_use]
    pub fn transfers(&self) -> Vec<Transfer> {
        lock(&self.shared.state)
            .entries
            .iter()
            .map(|e| e.transfer.clone())
            .collect()
    }

    /// Number of transfers holding a slot.
    #[must_use]
    pub fn active_count(&self) -> usize {
        lock(&self.shared.state).active.len()
    }

    /// Ids of waiting transfers in admission order.
    #[must_use]
    pub fn waiting_ids(&self) -> Vec<String> {
        let mut waiting: Vec<(Reverse<TransferPriority>, u64, Transfer)> = {
            let state = lock(&self.shared.state);
            state
                .waiting
                .iter()
                .map(|w| (Reverse(w.priority), w.seq, w.transfer.clone()))
                .collect()
        };
        waiting.sort_by_key(|(priority, seq, _)| (*priority, *seq));
        waiting.into_iter().map(|(_, _, t)| t.id()).collect()
    }

    /// Counts by status.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let transfers = self.transfers();
        let mut stats = SchedulerStats {
            total: transfers.len(),
            ..Default::default()
        };
        for transfer in &transfers {
            match transfer.status() {
                TransferStatus::Queued => stats.queued += 1,
                TransferStatus::Completed => stats.completed += 1,
                TransferStatus::Failed => stats.failed += 1,
                TransferStatus::Canceled => stats.canceled += 1,
                TransferStatus::Paused | TransferStatus::Unknown => stats.paused += 1,
                TransferStatus::Connecting
                | TransferStatus::Downloading
                | TransferStatus::Uploading
                | TransferStatus::Converting => stats.active += 1,
            }
        }
        stats
    }

    /// Try to receive a scheduler event without blocking.
    pub fn try_recv_event(&self) -> Option<SchedulerEvent> {
        lock(&self.event_rx).try_recv().ok()
    }

    /// Get a clone of the event sender for external use.
    #[must_use]
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SchedulerEvent> {
        self.shared.event_tx.clone()
    }
}

impl Default for TransferScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransferScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferScheduler").finish_non_exhaustive()
    }
}
