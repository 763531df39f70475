use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::{JoinError, JoinSet};
use tracing::{debug, trace};

use super::{ConnectionKey, DemuxSettings, DemuxStats};
use crate::protocol::conversation::{Conversation, EventSink};
use crate::protocol::{self, redis::RespLimits};
use crate::stream::{ReaderPool, StreamWriter};

/// Writer for a direction that has not been observed yet.
struct HalfOpen {
    writer: StreamWriter,
    created: SystemTime,
}

/// Matches the two directions of each connection into one conversation.
///
/// Connections are keyed by their server to client direction. The first
/// direction observed creates the conversation and parks the writer for the
/// other direction until it shows up or times out.
pub struct Demultiplexer {
    settings: Arc<DemuxSettings>,
    half_open: HashMap<ConnectionKey, HalfOpen>,
    pool: ReaderPool,
    conversations: JoinSet<()>,
    sink: Arc<dyn EventSink>,
    stats: Arc<DemuxStats>,
}

impl Demultiplexer {
    pub fn new(
        settings: Arc<DemuxSettings>,
        sink: Arc<dyn EventSink>,
        stats: Arc<DemuxStats>,
    ) -> Self {
        let pool = ReaderPool::new(settings.max_idle_readers, settings.max_line_length);
        Self {
            settings,
            half_open: HashMap::new(),
            pool,
            conversations: JoinSet::new(),
            sink,
            stats,
        }
    }

    /// Whether `key` carries server replies.
    pub fn is_from_server(&self, key: &ConnectionKey) -> bool {
        self.settings.ports.contains(&key.transport.src)
    }

    /// Returns the writer for a newly observed direction.
    ///
    /// Must be called from within a tokio runtime: the first direction of a
    /// connection spawns its conversation task.
    pub fn new_stream(&mut self, key: ConnectionKey, seen: SystemTime) -> StreamWriter {
        let from_server = self.is_from_server(&key);
        let canonical = if from_server { key } else { key.reverse() };

        if let Some(pending) = self.half_open.remove(&canonical) {
            trace!(conversation = %canonical, "paired half-open connection");
            return pending.writer;
        }

        let capacity = self.settings.stream_buffer_chunks;
        let mut client = self.pool.acquire();
        let mut server = self.pool.acquire();
        let client_writer = client.attach(capacity);
        let server_writer = server.attach(capacity);

        let conv = Conversation::new(
            canonical,
            client,
            server,
            Arc::clone(&self.sink),
            self.settings.event_buffer_size,
        )
        .with_release(self.pool.releaser());

        let limits: RespLimits = self.settings.resp_limits.clone();
        self.conversations.spawn(protocol::run(conv, limits));
        self.stats.record_conversation();
        debug!(conversation = %canonical, from_server, "new conversation");

        let (arriving, other) = if from_server {
            (server_writer, client_writer)
        } else {
            (client_writer, server_writer)
        };
        self.half_open.insert(
            canonical,
            HalfOpen {
                writer: other,
                created: seen,
            },
        );
        arriving
    }

    /// Drops half-open entries created before `now - timeout`. Their
    /// conversations observe the missing direction as lost data.
    pub fn evict_half_open(&mut self, now: SystemTime, timeout: Duration) -> usize {
        let Some(cutoff) = now.checked_sub(timeout) else {
            return 0;
        };

        let before = self.half_open.len();
        self.half_open.retain(|key, pending| {
            let keep = pending.created >= cutoff;
            if !keep {
                trace!(conversation = %key, "evicting half-open connection");
            }
            keep
        });
        before - self.half_open.len()
    }

    /// Conversation tasks not yet reaped.
    pub fn active_conversations(&self) -> usize {
        self.conversations.len()
    }

    /// Waits for the next conversation task to finish. `None` when no
    /// conversation is running.
    pub async fn join_next(&mut self) -> Option<Result<(), JoinError>> {
        self.conversations.join_next().await
    }

    /// Ends every parked direction and waits for all conversations to
    /// finish, so their events reach the sink before this returns.
    pub async fn drain(&mut self) {
        for (_, mut pending) in self.half_open.drain() {
            pending.writer.complete();
        }
        while let Some(joined) = self.conversations.join_next().await {
            if let Err(e) = joined {
                debug!(error = %e, "conversation task failed");
            }
        }
    }

    pub fn half_open_len(&self) -> usize {
        self.half_open.len()
    }

    /// Readers available for reuse.
    pub fn idle_readers(&mut self) -> usize {
        self.pool.idle_len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::net::{IpAddr, Ipv4Addr};

    use bytes::Bytes;

    use crate::protocol::event::EventType;
    use crate::protocol::testing::RecordingSink;

    fn client_to_server(client_port: u16) -> ConnectionKey {
        ConnectionKey::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            client_port,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            11211,
        )
    }

    fn demux(sink: Arc<RecordingSink>) -> (Demultiplexer, Arc<DemuxStats>) {
        let settings = DemuxSettings {
            ports: HashSet::from([11211]),
            ..Default::default()
        };
        let stats = Arc::new(DemuxStats::default());
        (
            Demultiplexer::new(Arc::new(settings), sink, Arc::clone(&stats)),
            stats,
        )
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_directions_pair_into_one_conversation() {
        let sink = Arc::new(RecordingSink::default());
        let (mut d, stats) = demux(Arc::clone(&sink));
        let now = SystemTime::now();

        let c2s = client_to_server(40000);
        assert!(!d.is_from_server(&c2s));
        assert!(d.is_from_server(&c2s.reverse()));

        let mut client = d.new_stream(c2s, now);
        assert_eq!(d.half_open_len(), 1);
        let mut server = d.new_stream(c2s.reverse(), now);
        assert_eq!(d.half_open_len(), 0);
        assert_eq!(stats.snapshot().conversations_started, 1);

        client.reassembled(Bytes::from_static(b"get k1\r\n"), now, 0);
        client.complete();
        server.reassembled(Bytes::from_static(b"VALUE k1 0 2\r\nhi\r\nEND\r\n"), now, 0);
        server.complete();
        settle().await;

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::GetHit);
        assert_eq!(events[0].key, "k1");
        assert_eq!(d.idle_readers(), 2);
    }

    #[tokio::test]
    async fn test_server_direction_first() {
        let sink = Arc::new(RecordingSink::default());
        let (mut d, stats) = demux(sink);
        let now = SystemTime::now();

        let s2c = client_to_server(40001).reverse();
        let _server = d.new_stream(s2c, now);
        let _client = d.new_stream(s2c.reverse(), now);
        assert_eq!(d.half_open_len(), 0);
        assert_eq!(stats.snapshot().conversations_started, 1);
    }

    #[tokio::test]
    async fn test_evict_half_open() {
        let sink = Arc::new(RecordingSink::default());
        let (mut d, _) = demux(sink);
        let t0 = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);

        // Server directions arrive first, parking the client writers.
        let _a = d.new_stream(client_to_server(40000).reverse(), t0);
        let _b = d.new_stream(
            client_to_server(40001).reverse(),
            t0 + Duration::from_secs(20),
        );
        assert_eq!(d.half_open_len(), 2);

        let evicted = d.evict_half_open(t0 + Duration::from_secs(31), Duration::from_secs(30));
        assert_eq!(evicted, 1);
        assert_eq!(d.half_open_len(), 1);

        // The evicted client direction reads as lost data, ending the conversation.
        settle().await;
        assert_eq!(d.idle_readers(), 2);
    }

    #[tokio::test]
    async fn test_drain_waits_for_conversations() {
        let sink = Arc::new(RecordingSink::default());
        let (mut d, _) = demux(Arc::clone(&sink));
        let now = SystemTime::now();

        // Only the client direction is seen; the server writer stays parked.
        let c2s = client_to_server(40002);
        let mut client = d.new_stream(c2s, now);
        client.reassembled(Bytes::from_static(b"get k1\r\n"), now, 0);
        client.complete();
        assert_eq!(d.active_conversations(), 1);

        d.drain().await;
        assert_eq!(d.active_conversations(), 0);
        assert_eq!(d.half_open_len(), 0);
        assert!(sink.events().is_empty());
        assert_eq!(d.idle_readers(), 2);
    }
}
