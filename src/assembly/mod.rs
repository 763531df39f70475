//! Pairs reassembled TCP directions into conversations.
//!
//! Upstream reassembly hands [`Delivery`] batches to a [`DemuxPool`], which
//! routes them to single-threaded workers. Each worker owns a
//! [`Demultiplexer`] that matches the two directions of a connection and
//! spawns one conversation task per connection.

mod demux;
mod worker;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use thiserror::Error;

pub use demux::Demultiplexer;
pub use worker::DemuxPool;

use crate::protocol::conversation::DEFAULT_EVENT_BUFFER;
use crate::protocol::redis::RespLimits;

/// Network-layer endpoints of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Transport-layer ports of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

/// Identifies one direction of one TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub net: NetFlow,
    pub transport: TransportFlow,
}

impl ConnectionKey {
    pub fn new(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            net: NetFlow { src, dst },
            transport: TransportFlow {
                src: src_port,
                dst: dst_port,
            },
        }
    }

    /// The opposite direction of the same connection.
    pub fn reverse(&self) -> Self {
        Self {
            net: NetFlow {
                src: self.net.dst,
                dst: self.net.src,
            },
            transport: TransportFlow {
                src: self.transport.dst,
                dst: self.transport.src,
            },
        }
    }

    /// Hash that is identical for both directions of a connection.
    pub fn symmetric_hash(&self) -> u64 {
        let a = (self.net.src, self.transport.src);
        let b = (self.net.dst, self.transport.dst);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut hasher = DefaultHasher::new();
        lo.hash(&mut hasher);
        hi.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.net.src, self.transport.src, self.net.dst, self.transport.dst
        )
    }
}

/// One unit of reassembled traffic for a direction.
#[derive(Debug)]
pub struct Delivery {
    pub key: ConnectionKey,
    /// Capture time of the last byte in this delivery.
    pub seen: SystemTime,
    pub kind: DeliveryKind,
}

#[derive(Debug)]
pub enum DeliveryKind {
    /// Contiguous bytes. `skipped > 0` reports a gap before them.
    Data { bytes: Bytes, skipped: u64 },
    /// The direction was closed by FIN/RST or flushed by reassembly.
    Complete,
}

impl Delivery {
    pub fn data(key: ConnectionKey, seen: SystemTime, bytes: Bytes) -> Self {
        Self {
            key,
            seen,
            kind: DeliveryKind::Data { bytes, skipped: 0 },
        }
    }

    pub fn gap(key: ConnectionKey, seen: SystemTime, bytes: Bytes, skipped: u64) -> Self {
        Self {
            key,
            seen,
            kind: DeliveryKind::Data { bytes, skipped },
        }
    }

    pub fn complete(key: ConnectionKey, seen: SystemTime) -> Self {
        Self {
            key,
            seen,
            kind: DeliveryKind::Complete,
        }
    }
}

/// Rejection reasons for a delivery batch.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("demultiplexer queue full, dropped {dropped} deliveries")]
    QueueFull { dropped: usize },

    #[error("demultiplexer stopped")]
    Closed,
}

/// Tuning for the demultiplexer workers.
#[derive(Debug, Clone)]
pub struct DemuxSettings {
    /// Ports identifying the server side of a connection.
    pub ports: HashSet<u16>,
    pub workers: usize,
    /// Delivery batches queued per worker.
    pub queue_size: usize,
    /// Chunks buffered per direction before it is torn down.
    pub stream_buffer_chunks: usize,
    pub half_open_timeout: Duration,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
    pub max_idle_readers: usize,
    pub max_line_length: usize,
    pub event_buffer_size: usize,
    pub resp_limits: RespLimits,
}

impl Default for DemuxSettings {
    fn default() -> Self {
        Self {
            ports: HashSet::from([11211]),
            workers: 8,
            queue_size: 128,
            stream_buffer_chunks: 64,
            half_open_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            max_idle_readers: 1024,
            max_line_length: 64 * 1024,
            event_buffer_size: DEFAULT_EVENT_BUFFER,
            resp_limits: RespLimits::default(),
        }
    }
}

/// Lock-free pipeline counters shared by the pool and its workers.
#[derive(Debug, Default)]
pub struct DemuxStats {
    deliveries_handled: AtomicU64,
    deliveries_dropped: AtomicU64,
    conversations_started: AtomicU64,
}

/// Point-in-time copy of [`DemuxStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DemuxStatsSnapshot {
    pub deliveries_handled: u64,
    pub deliveries_dropped: u64,
    pub conversations_started: u64,
}

impl DemuxStats {
    pub fn record_handled(&self, n: usize) {
        self.deliveries_handled.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: usize) {
        self.deliveries_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_conversation(&self) {
        self.conversations_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DemuxStatsSnapshot {
        DemuxStatsSnapshot {
            deliveries_handled: self.deliveries_handled.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
            conversations_started: self.conversations_started.load(Ordering::Relaxed),
        }
    }
}
