//! Store events and the index work queue
//!
//! Publishers never wait on the index: events go into a bounded queue, and
//! when the queue is full the send is handed to a background task. A fixed
//! pool of workers drains the queue. Delivery is at-least-once and the
//! handlers are idempotent.

use super::BrowseIndex;
use crate::store::model::ArtifactKey;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What happened to an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEventKind {
    Stored,
    Deleted,
}

/// A committed change to one artifact key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: ArtifactKey,
    pub kind: StoreEventKind,
}

impl StoreEvent {
    pub fn stored(key: ArtifactKey) -> Self {
        Self {
            key,
            kind: StoreEventKind::Stored,
        }
    }

    pub fn deleted(key: ArtifactKey) -> Self {
        Self {
            key,
            kind: StoreEventKind::Deleted,
        }
    }
}

/// Events published but not yet handled
#[derive(Default)]
struct Backlog {
    pending: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn done(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Sending half of the index work queue
#[derive(Clone)]
pub struct StoreEventPublisher {
    sender: mpsc::Sender<StoreEvent>,
    backlog: Arc<Backlog>,
}

impl StoreEventPublisher {
    /// Enqueue an event without waiting for queue capacity
    pub fn publish(&self, event: StoreEvent) {
        self.backlog.pending.fetch_add(1, Ordering::SeqCst);

        match self.sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                debug!(key = %event.key, "Index queue full, deferring event");
                let sender = self.sender.clone();
                let backlog = self.backlog.clone();
                tokio::spawn(async move {
                    if sender.send(event).await.is_err() {
                        backlog.done();
                    }
                });
            }
            Err(TrySendError::Closed(event)) => {
                warn!(key = %event.key, "Index workers stopped, dropping event");
                self.backlog.done();
            }
        }
    }

    /// Events published but not yet handled
    pub fn pending(&self) -> usize {
        self.backlog.pending.load(Ordering::SeqCst)
    }

    /// Wait until every published event has been handled
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.backlog.idle.notified();
            if self.pending() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Handle on the running index workers
pub struct IndexWorkers {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    receiver: Arc<Mutex<mpsc::Receiver<StoreEvent>>>,
    backlog: Arc<Backlog>,
}

impl IndexWorkers {
    /// Start `workers` tasks draining a queue of `capacity` events into
    /// `index`
    pub fn spawn(
        index: Arc<BrowseIndex>,
        workers: usize,
        capacity: usize,
    ) -> (StoreEventPublisher, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let backlog = Arc::new(Backlog::default());
        let cancel = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker| {
                let index = index.clone();
                let receiver = receiver.clone();
                let backlog = backlog.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    run_worker(worker, index, receiver, backlog, cancel).await;
                })
            })
            .collect();

        (
            StoreEventPublisher {
                sender,
                backlog: backlog.clone(),
            },
            Self {
                handles,
                cancel,
                receiver,
                backlog,
            },
        )
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop the workers. Events still queued are dropped and count as
    /// handled, so `wait_idle` callers are released.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Index worker panicked");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut dropped = 0usize;
        while let Ok(event) = receiver.try_recv() {
            debug!(key = %event.key, "Dropping queued event");
            self.backlog.done();
            dropped += 1;
        }
        info!(dropped, "Index workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    index: Arc<BrowseIndex>,
    receiver: Arc<Mutex<mpsc::Receiver<StoreEvent>>>,
    backlog: Arc<Backlog>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = async { receiver.lock().await.recv().await } => event,
        };
        let Some(event) = event else {
            break;
        };

        debug!(worker, key = %event.key, kind = ?event.kind, "Handling store event");
        index.handle(&event).await;
        backlog.done();
    }
    debug!(worker, "Index worker exiting");
}
