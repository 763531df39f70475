use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::report::KeyReport;
use crate::protocol::event::{Event, EventType};

/// Control mailbox depth per shard.
const CONTROL_QUEUE_SIZE: usize = 8;

/// Per-key counters owned by exactly one shard task.
#[derive(Debug, Default)]
pub struct Shard {
    key_counts: HashMap<String, KeyReport>,
}

impl Shard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a batch into the counters. Only hits are counted.
    pub fn apply(&mut self, events: &[Event]) {
        for event in events {
            if event.event_type != EventType::GetHit {
                continue;
            }
            match self.key_counts.get_mut(&event.key) {
                Some(report) => report.record_hit(event.size),
                None => {
                    self.key_counts.insert(
                        event.key.clone(),
                        KeyReport::first_hit(event.key.clone(), event.size),
                    );
                }
            }
        }
    }

    /// Copies the current counters without modifying them.
    pub fn snapshot(&self) -> Vec<KeyReport> {
        self.key_counts.values().cloned().collect()
    }

    pub fn reset(&mut self) {
        self.key_counts.clear();
    }

    pub fn len(&self) -> usize {
        self.key_counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_counts.is_empty()
    }
}

/// Requests serviced ahead of newly arriving events. A snapshot first folds
/// in every batch already queued when it is handled.
pub(crate) enum Control {
    Snapshot(oneshot::Sender<Vec<KeyReport>>),
    Reset,
}

/// Mailboxes of a running shard task.
pub(crate) struct ShardHandle {
    pub events: mpsc::Sender<Vec<Event>>,
    pub control: mpsc::Sender<Control>,
}

/// Spawns a shard task on the current runtime.
pub(crate) fn spawn_shard(
    id: usize,
    queue_size: usize,
    ctx: CancellationToken,
) -> (ShardHandle, JoinHandle<()>) {
    let (events_tx, events_rx) = mpsc::channel(queue_size.max(1));
    let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE_SIZE);

    let handle = tokio::spawn(run_shard(id, queue_size.max(1), events_rx, control_rx, ctx));
    (
        ShardHandle {
            events: events_tx,
            control: control_tx,
        },
        handle,
    )
}

async fn run_shard(
    id: usize,
    queue_size: usize,
    mut events_rx: mpsc::Receiver<Vec<Event>>,
    mut control_rx: mpsc::Receiver<Control>,
    ctx: CancellationToken,
) {
    let mut shard = Shard::new();

    loop {
        tokio::select! {
            biased;

            msg = control_rx.recv() => match msg {
                Some(Control::Snapshot(reply)) => {
                    // Bounded so a busy producer cannot stall the report.
                    for _ in 0..queue_size {
                        match events_rx.try_recv() {
                            Ok(batch) => shard.apply(&batch),
                            Err(_) => break,
                        }
                    }
                    let _ = reply.send(shard.snapshot());
                }
                Some(Control::Reset) => shard.reset(),
                None => break,
            },

            batch = events_rx.recv() => match batch {
                Some(batch) => shard.apply(&batch),
                None => break,
            },

            _ = ctx.cancelled() => break,
        }
    }

    debug!(shard = id, keys = shard.len(), "analysis shard stopped");
}
