use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::demux::Demultiplexer;
use super::{
    ConnectionKey, Delivery, DeliveryError, DeliveryKind, DemuxSettings, DemuxStats,
    DemuxStatsSnapshot,
};
use crate::protocol::conversation::EventSink;
use crate::stream::StreamWriter;

/// A direction currently being fed.
struct LiveStream {
    writer: StreamWriter,
    last_seen: SystemTime,
}

/// Single-threaded actor owning one [`Demultiplexer`] and the directions
/// routed to it.
struct DemuxWorker {
    id: usize,
    demux: Demultiplexer,
    streams: HashMap<ConnectionKey, LiveStream>,
    /// Most recent capture time observed; drives timeouts.
    latest_seen: SystemTime,
    settings: Arc<DemuxSettings>,
}

impl DemuxWorker {
    fn new(
        id: usize,
        settings: Arc<DemuxSettings>,
        sink: Arc<dyn EventSink>,
        stats: Arc<DemuxStats>,
    ) -> Self {
        Self {
            id,
            demux: Demultiplexer::new(Arc::clone(&settings), sink, stats),
            streams: HashMap::new(),
            latest_seen: SystemTime::UNIX_EPOCH,
            settings,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Vec<Delivery>>, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Queued batches are drained before cancellation is honored.
        loop {
            tokio::select! {
                biased;

                _ = ticker.tick() => {
                    self.sweep();
                }

                batch = rx.recv() => {
                    let Some(batch) = batch else {
                        break;
                    };
                    for delivery in batch {
                        self.handle(delivery);
                    }
                }

                joined = self.demux.join_next(), if self.demux.active_conversations() > 0 => {
                    if let Some(Err(e)) = joined {
                        debug!(worker = self.id, error = %e, "conversation task failed");
                    }
                }

                _ = ctx.cancelled() => break,
            }
        }

        let open = self.streams.len();
        for (_, mut stream) in self.streams.drain() {
            stream.writer.complete();
        }
        self.demux.drain().await;
        debug!(worker = self.id, open, "demux worker stopped");
    }

    fn handle(&mut self, delivery: Delivery) {
        let Delivery { key, seen, kind } = delivery;
        if seen > self.latest_seen {
            self.latest_seen = seen;
        }

        match kind {
            DeliveryKind::Data { bytes, skipped } => {
                let stream = match self.streams.entry(key) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(e) => e.insert(LiveStream {
                        writer: self.demux.new_stream(key, seen),
                        last_seen: seen,
                    }),
                };
                stream.last_seen = seen;

                if stream.writer.is_open() && !stream.writer.reassembled(bytes, seen, skipped) {
                    trace!(conversation = %key, skipped, "direction torn down");
                }
            }
            DeliveryKind::Complete => {
                if let Some(mut stream) = self.streams.remove(&key) {
                    stream.writer.complete();
                }
            }
        }
    }

    /// Completes idle directions and evicts stale half-open connections.
    fn sweep(&mut self) {
        let now = self.latest_seen;
        if let Some(cutoff) = now.checked_sub(self.settings.idle_timeout) {
            let before = self.streams.len();
            self.streams.retain(|_, stream| {
                if stream.last_seen < cutoff {
                    stream.writer.complete();
                    false
                } else {
                    true
                }
            });
            let idle = before - self.streams.len();
            if idle > 0 {
                debug!(worker = self.id, idle, "completed idle streams");
            }
        }

        let evicted = self
            .demux
            .evict_half_open(now, self.settings.half_open_timeout);
        if evicted > 0 {
            debug!(worker = self.id, evicted, "evicted half-open connections");
        }
    }
}

/// Routes delivery batches across demultiplexer workers.
///
/// Both directions of a connection always land on the same worker.
pub struct DemuxPool {
    senders: Vec<mpsc::Sender<Vec<Delivery>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<DemuxStats>,
    ctx: CancellationToken,
}

impl DemuxPool {
    /// Spawns the workers on the current tokio runtime.
    pub fn spawn(settings: DemuxSettings, sink: Arc<dyn EventSink>, ctx: CancellationToken) -> Self {
        let settings = Arc::new(settings);
        let stats = Arc::new(DemuxStats::default());
        let ctx = ctx.child_token();
        let workers = settings.workers.max(1);

        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
            let worker = DemuxWorker::new(
                id,
                Arc::clone(&settings),
                Arc::clone(&sink),
                Arc::clone(&stats),
            );
            handles.push(tokio::spawn(worker.run(rx, ctx.clone())));
            senders.push(tx);
        }

        info!(workers, ports = ?settings.ports, "demultiplexer started");

        Self {
            senders,
            handles: Mutex::new(handles),
            stats,
            ctx,
        }
    }

    /// Queues deliveries without blocking. Batches for a worker whose
    /// mailbox is full are dropped and counted.
    pub fn handle_deliveries(&self, deliveries: Vec<Delivery>) -> Result<(), DeliveryError> {
        if deliveries.is_empty() {
            return Ok(());
        }

        let n = self.senders.len();
        if n == 0 || self.ctx.is_cancelled() {
            self.stats.record_dropped(deliveries.len());
            return Err(DeliveryError::Closed);
        }
        let mut batches: Vec<Vec<Delivery>> = (0..n).map(|_| Vec::new()).collect();
        for delivery in deliveries {
            let idx = (delivery.key.symmetric_hash() % n as u64) as usize;
            if let Some(batch) = batches.get_mut(idx) {
                batch.push(delivery);
            }
        }

        let mut dropped = 0;
        let mut closed = false;
        for (sender, batch) in self.senders.iter().zip(batches) {
            if batch.is_empty() {
                continue;
            }
            let len = batch.len();
            match sender.try_send(batch) {
                Ok(()) => self.stats.record_handled(len),
                Err(mpsc::error::TrySendError::Full(_)) => dropped += len,
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dropped += len;
                    closed = true;
                }
            }
        }

        if dropped == 0 {
            return Ok(());
        }

        self.stats.record_dropped(dropped);
        debug!(dropped, "demultiplexer queue full, dropping deliveries");
        if closed {
            Err(DeliveryError::Closed)
        } else {
            Err(DeliveryError::QueueFull { dropped })
        }
    }

    pub fn stats(&self) -> DemuxStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Stops the workers once their queued batches are handled. Open
    /// directions are completed and every conversation has flushed its
    /// events to the sink by the time this returns.
    pub async fn shutdown(&self) {
        self.ctx.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "demux worker task failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use bytes::Bytes;

    use crate::protocol::event::EventType;
    use crate::protocol::testing::RecordingSink;

    fn c2s(client_port: u16) -> ConnectionKey {
        ConnectionKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            client_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            6379,
        )
    }

    fn settings() -> Arc<DemuxSettings> {
        Arc::new(DemuxSettings {
            ports: HashSet::from([6379]),
            idle_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            ..Default::default()
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_worker_routes_both_directions() {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(DemuxStats::default());
        let mut worker = DemuxWorker::new(0, settings(), sink.clone(), stats);
        let now = SystemTime::now();

        let key = c2s(50000);
        worker.handle(Delivery::data(key, now, Bytes::from_static(b"*2\r\n$3\r\nGET\r\n")));
        worker.handle(Delivery::data(key, now, Bytes::from_static(b"$1\r\na\r\n")));
        worker.handle(Delivery::data(key.reverse(), now, Bytes::from_static(b"$-1\r\n")));
        worker.handle(Delivery::complete(key, now));
        worker.handle(Delivery::complete(key.reverse(), now));
        assert!(worker.streams.is_empty());
        settle().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::GetMiss);
        assert_eq!(events[0].key, "a");
    }

    #[tokio::test]
    async fn test_sweep_completes_idle_streams() {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(DemuxStats::default());
        let mut worker = DemuxWorker::new(0, settings(), sink.clone(), stats);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(10_000);

        let idle = c2s(50001);
        worker.handle(Delivery::data(idle, t0, Bytes::from_static(b"*1\r\n$4\r\nPING\r\n")));
        worker.handle(Delivery::data(idle.reverse(), t0, Bytes::from_static(b"+PONG\r\n")));

        let active = c2s(50002);
        let later = t0 + Duration::from_secs(90);
        worker.handle(Delivery::data(active, later, Bytes::from_static(b"*1\r\n$4\r\nPING\r\n")));

        worker.sweep();
        assert_eq!(worker.streams.len(), 1);
        assert!(worker.streams.contains_key(&active));
        assert_eq!(worker.demux.half_open_len(), 1);
        settle().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::CommandExecuted);
    }

    #[tokio::test]
    async fn test_gap_tears_down_direction() {
        let sink = Arc::new(RecordingSink::default());
        let stats = Arc::new(DemuxStats::default());
        let mut worker = DemuxWorker::new(0, settings(), sink.clone(), stats);
        let now = SystemTime::now();

        let key = c2s(50003);
        worker.handle(Delivery::data(key.reverse(), now, Bytes::new()));
        worker.handle(Delivery::gap(key, now, Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"), 512));
        worker.handle(Delivery::data(key, now, Bytes::from_static(b"*1\r\n$4\r\nPING\r\n")));
        worker.handle(Delivery::data(key.reverse(), now, Bytes::from_static(b"+PONG\r\n")));
        settle().await;

        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_pool_processes_deliveries() {
        let sink = Arc::new(RecordingSink::default());
        let ctx = CancellationToken::new();
        let pool = DemuxPool::spawn(
            DemuxSettings {
                ports: HashSet::from([6379]),
                workers: 4,
                ..Default::default()
            },
            sink.clone(),
            ctx.clone(),
        );
        assert_eq!(pool.workers(), 4);

        let now = SystemTime::now();
        let mut batch = Vec::new();
        for port in 40000..40010u16 {
            let key = c2s(port);
            batch.push(Delivery::data(key, now, Bytes::from_static(b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n")));
            batch.push(Delivery::data(key.reverse(), now, Bytes::from_static(b"$2\r\nhi\r\n")));
            batch.push(Delivery::complete(key, now));
            batch.push(Delivery::complete(key.reverse(), now));
        }
        pool.handle_deliveries(batch).unwrap();

        // Shutdown waits for the conversations, so no settling is needed.
        pool.shutdown().await;

        let hits = sink
            .events()
            .iter()
            .filter(|e| e.event_type == EventType::GetHit && e.size == 2)
            .count();
        assert_eq!(hits, 10);
    }

    #[tokio::test]
    async fn test_pool_full_mailbox_drops() {
        let (tx, _rx) = mpsc::channel(1);
        let pool = DemuxPool {
            senders: vec![tx],
            handles: Mutex::new(Vec::new()),
            stats: Arc::new(DemuxStats::default()),
            ctx: CancellationToken::new(),
        };

        let now = SystemTime::now();
        assert!(pool
            .handle_deliveries(vec![Delivery::complete(c2s(1), now)])
            .is_ok());
        assert_eq!(
            pool.handle_deliveries(vec![
                Delivery::complete(c2s(1), now),
                Delivery::complete(c2s(2), now),
            ]),
            Err(DeliveryError::QueueFull { dropped: 2 })
        );

        let stats = pool.stats();
        assert_eq!(stats.deliveries_handled, 1);
        assert_eq!(stats.deliveries_dropped, 2);
    }
}
