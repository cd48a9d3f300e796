//! # Queue Fabric
//!
//! Three bounded FIFO queues with companion worker-slot semaphores:
//!
//! | Queue | Feeds | Drained by |
//! |-------|-------|------------|
//! | `Prio` | sections signed by an already-known zone | priority pool, then shared pool |
//! | `Normal` | everything else except notifications | shared pool |
//! | `Notify` | notifications | notification pool |
//!
//! The priority dispatcher drains `Prio` exclusively. The shared
//! dispatcher re-checks `Prio` before every take from `Normal`, so
//! priority work preempts the normal backlog. Each dispatched item runs in
//! its own task holding one semaphore permit; permit counts are the
//! configured worker counts.
//!
//! A full queue drops the item at enqueue; the caller answers the sender
//! with `UnspecServerErr`. Shutdown is a broadcast: dispatchers finish the
//! item in flight, leave the rest of the queue behind, and exit.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::{Outbound, TrustEngine};
use crate::message::{Peer, Section, Token};

/// One unit of pipeline work: a single section with its provenance.
#[derive(Clone, Debug)]
pub struct WorkItem {
    pub section: Section,
    pub sender: Peer,
    pub token: Token,
}

/// Queue a work item is classified onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueClass {
    Prio,
    Normal,
    Notify,
}

/// Buffer and worker-slot sizing for the three queues.
#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub prio_buffer: usize,
    pub normal_buffer: usize,
    pub notify_buffer: usize,
    pub prio_workers: usize,
    pub normal_workers: usize,
    pub notify_workers: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            prio_buffer: 50,
            normal_buffer: 100,
            notify_buffer: 10,
            prio_workers: 2,
            normal_workers: 10,
            notify_workers: 2,
        }
    }
}

/// Sending side of the queue fabric. Cheap to clone.
#[derive(Clone)]
pub struct QueueFabric {
    prio_tx: mpsc::Sender<WorkItem>,
    normal_tx: mpsc::Sender<WorkItem>,
    notify_tx: mpsc::Sender<WorkItem>,
}

/// Receiving side, consumed once by [`spawn_workers`].
pub struct QueueReceivers {
    prio_rx: mpsc::Receiver<WorkItem>,
    normal_rx: mpsc::Receiver<WorkItem>,
    notify_rx: mpsc::Receiver<WorkItem>,
}

impl QueueFabric {
    pub fn new(config: &QueueConfig) -> (QueueFabric, QueueReceivers) {
        let (prio_tx, prio_rx) = mpsc::channel(config.prio_buffer.max(1));
        let (normal_tx, normal_rx) = mpsc::channel(config.normal_buffer.max(1));
        let (notify_tx, notify_rx) = mpsc::channel(config.notify_buffer.max(1));
        (
            QueueFabric {
                prio_tx,
                normal_tx,
                notify_tx,
            },
            QueueReceivers {
                prio_rx,
                normal_rx,
                notify_rx,
            },
        )
    }

    /// Classify a section: notifications to `Notify`, signable sections
    /// whose zone key is already cached to `Prio`, everything else to
    /// `Normal`.
    pub fn classify(section: &Section, zone_known: bool) -> QueueClass {
        match section {
            Section::Notification(_) => QueueClass::Notify,
            s if s.is_signable() && zone_known => QueueClass::Prio,
            _ => QueueClass::Normal,
        }
    }

    /// Non-blocking enqueue. A full queue returns the item back so the
    /// caller can notify the sender.
    pub fn enqueue(&self, class: QueueClass, item: WorkItem) -> Result<(), WorkItem> {
        let tx = match class {
            QueueClass::Prio => &self.prio_tx,
            QueueClass::Normal => &self.normal_tx,
            QueueClass::Notify => &self.notify_tx,
        };
        tx.try_send(item).map_err(|err| {
            debug!(?class, "queue full, dropping item");
            match err {
                mpsc::error::TrySendError::Full(item) => item,
                mpsc::error::TrySendError::Closed(item) => item,
            }
        })
    }
}

/// Spawn the three worker pools. Each processed item's outbound replies go
/// to `out_tx`; `shutdown` stops the dispatchers after their in-flight
/// item.
pub fn spawn_workers(
    receivers: QueueReceivers,
    config: &QueueConfig,
    engine: Arc<TrustEngine>,
    out_tx: mpsc::Sender<Outbound>,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let prio_rx = Arc::new(tokio::sync::Mutex::new(receivers.prio_rx));
    let prio_slots = Arc::new(Semaphore::new(config.prio_workers.max(1)));
    let normal_slots = Arc::new(Semaphore::new(config.normal_workers.max(1)));
    let notify_slots = Arc::new(Semaphore::new(config.notify_workers.max(1)));

    let priority = tokio::spawn(run_priority(
        prio_rx.clone(),
        prio_slots.clone(),
        engine.clone(),
        out_tx.clone(),
        shutdown.subscribe(),
    ));
    let shared = tokio::spawn(run_shared(
        prio_rx,
        receivers.normal_rx,
        prio_slots,
        normal_slots,
        engine.clone(),
        out_tx.clone(),
        shutdown.subscribe(),
    ));
    let notification = tokio::spawn(run_notifications(
        receivers.notify_rx,
        notify_slots,
        engine,
        out_tx,
        shutdown.subscribe(),
    ));
    vec![priority, shared, notification]
}

/// Priority pool: drains `Prio` exclusively.
async fn run_priority(
    prio_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    slots: Arc<Semaphore>,
    engine: Arc<TrustEngine>,
    out_tx: mpsc::Sender<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let item = {
            let mut rx = prio_rx.lock().await;
            tokio::select! {
                biased;
                _ = shutdown.recv() => break,
                item = rx.recv() => item,
            }
        };
        let Some(item) = item else { break };
        dispatch(item, &slots, &engine, &out_tx).await;
    }
    info!("priority worker pool stopped");
}

/// Shared pool: re-checks `Prio` before every take from `Normal`.
async fn run_shared(
    prio_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    mut normal_rx: mpsc::Receiver<WorkItem>,
    prio_slots: Arc<Semaphore>,
    normal_slots: Arc<Semaphore>,
    engine: Arc<TrustEngine>,
    out_tx: mpsc::Sender<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        // Priority first: steal an available item without blocking the
        // priority pool.
        if let Ok(mut rx) = prio_rx.try_lock() {
            if let Ok(item) = rx.try_recv() {
                drop(rx);
                let slots = if prio_slots.available_permits() > 0 {
                    &prio_slots
                } else {
                    &normal_slots
                };
                dispatch(item, slots, &engine, &out_tx).await;
                continue;
            }
        }
        let item = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            item = normal_rx.recv() => item,
        };
        let Some(item) = item else { break };
        dispatch(item, &normal_slots, &engine, &out_tx).await;
    }
    info!("shared worker pool stopped");
}

/// Notification pool.
async fn run_notifications(
    mut notify_rx: mpsc::Receiver<WorkItem>,
    slots: Arc<Semaphore>,
    engine: Arc<TrustEngine>,
    out_tx: mpsc::Sender<Outbound>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = shutdown.recv() => break,
            item = notify_rx.recv() => item,
        };
        let Some(item) = item else { break };
        dispatch(item, &slots, &engine, &out_tx).await;
    }
    info!("notification worker pool stopped");
}

/// Lease a worker slot and run one item on it. The engine call is
/// synchronous; replies are forwarded on the outbound channel afterwards,
/// so no cache lock is held across I/O.
async fn dispatch(
    item: WorkItem,
    slots: &Arc<Semaphore>,
    engine: &Arc<TrustEngine>,
    out_tx: &mpsc::Sender<Outbound>,
) {
    let permit = slots
        .clone()
        .acquire_owned()
        .await
        .expect("worker semaphore closed");
    let engine = engine.clone();
    let out_tx = out_tx.clone();
    tokio::spawn(async move {
        let replies = engine.process(item.section, item.sender, item.token);
        for outbound in replies {
            if out_tx.send(outbound).await.is_err() {
                debug!("outbound channel closed, dropping reply");
                break;
            }
        }
        drop(permit);
    });
}
