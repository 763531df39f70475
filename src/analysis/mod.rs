//! Sharded per-key aggregation of conversation events.
//!
//! Events are routed by conversation to one of N shard tasks. Each shard owns
//! its key table outright; the pool only shares counters and the key filter.

mod filter;
mod report;
mod shard;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use filter::{FilterError, KeyFilter};
pub use report::{KeyReport, Report};
pub use shard::Shard;

use crate::protocol::conversation::{ConversationId, EventSink, SubmitError};
use crate::protocol::event::Event;
use shard::{spawn_shard, Control, ShardHandle};

/// Event counters for the aggregator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub events_handled: u64,
    pub events_dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    handled: AtomicU64,
    dropped: AtomicU64,
}

/// Owns the shard tasks and routes event batches to them.
pub struct Pool {
    shards: Vec<ShardHandle>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    filter: KeyFilter,
    counters: Counters,
    ctx: CancellationToken,
}

impl Pool {
    /// Spawns `shards` shard tasks on the current tokio runtime, each with an
    /// event mailbox of `queue_size` batches.
    pub fn spawn(shards: usize, queue_size: usize, ctx: CancellationToken) -> Self {
        let ctx = ctx.child_token();
        let n = shards.max(1);

        let mut handles = Vec::with_capacity(n);
        let mut senders = Vec::with_capacity(n);
        for id in 0..n {
            let (shard, handle) = spawn_shard(id, queue_size, ctx.clone());
            senders.push(shard);
            handles.push(handle);
        }

        info!(shards = n, queue_size, "analysis pool started");

        Self {
            shards: senders,
            handles: Mutex::new(handles),
            filter: KeyFilter::new(),
            counters: Counters::default(),
            ctx,
        }
    }

    /// Filters and queues a batch without blocking. Events removed by the key
    /// filter are not counted.
    pub fn handle_events(
        &self,
        conversation: ConversationId,
        mut events: Vec<Event>,
    ) -> Result<(), SubmitError> {
        if let Some(re) = self.filter.current() {
            events.retain(|e| re.is_match(&e.key));
        }
        if events.is_empty() {
            return Ok(());
        }

        let len = events.len() as u64;
        let idx = (conversation.0 % self.shards.len() as u64) as usize;
        let Some(shard) = self.shards.get(idx) else {
            self.counters.dropped.fetch_add(len, Ordering::Relaxed);
            return Err(SubmitError::Closed);
        };

        match shard.events.try_send(events) {
            Ok(()) => {
                self.counters.handled.fetch_add(len, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(len, Ordering::Relaxed);
                debug!(shard = idx, dropped = len, "analysis shard full, dropping events");
                Err(SubmitError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.counters.dropped.fetch_add(len, Ordering::Relaxed);
                Err(SubmitError::Closed)
            }
        }
    }

    /// Collects every shard's keys, busiest first. With `should_reset`
    /// each shard is cleared right after it is read.
    pub async fn report(&self, should_reset: bool) -> Report {
        let mut keys = Vec::new();

        for (idx, shard) in self.shards.iter().enumerate() {
            let (tx, rx) = oneshot::channel();
            if shard.control.send(Control::Snapshot(tx)).await.is_err() {
                debug!(shard = idx, "analysis shard stopped, skipping");
                continue;
            }
            match rx.await {
                Ok(mut snap) => keys.append(&mut snap),
                Err(_) => continue,
            }
            if should_reset {
                let _ = shard.control.send(Control::Reset).await;
            }
        }

        Report::new(SystemTime::now(), keys)
    }

    /// Replaces the key filter. See [`KeyFilter::set_pattern`].
    pub fn set_filter_pattern(&self, pattern: &str) -> Result<(), FilterError> {
        self.filter.set_pattern(pattern)?;
        info!(pattern, "key filter updated");
        Ok(())
    }

    pub fn filter_pattern(&self) -> Option<String> {
        self.filter.pattern()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            events_handled: self.counters.handled.load(Ordering::Relaxed),
            events_dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn shards(&self) -> usize {
        self.shards.len()
    }

    /// Stops the shard tasks and waits for them to exit.
    pub async fn shutdown(&self) {
        self.ctx.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "analysis shard task failed");
            }
        }
    }
}

impl EventSink for Pool {
    fn submit_events(
        &self,
        conversation: ConversationId,
        events: Vec<Event>,
    ) -> Result<(), SubmitError> {
        self.handle_events(conversation, events)
    }
}
