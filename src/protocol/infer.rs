use std::fmt;

use tracing::{debug, info, trace};

use super::conversation::Conversation;
use super::redis::RespLimits;
use super::{mctext, redis};

/// First byte of every binary memcached request.
const MEMCACHE_BINARY_MAGIC: u8 = 0x80;

/// Wire protocol spoken on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    MemcacheText,
    MemcacheBinary,
    Redis,
}

impl Protocol {
    /// Selects a protocol from the first byte the client sent.
    pub const fn from_first_byte(b: u8) -> Self {
        match b {
            MEMCACHE_BINARY_MAGIC => Self::MemcacheBinary,
            b'*' => Self::Redis,
            _ => Self::MemcacheText,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MemcacheText => "memcache_text",
            Self::MemcacheBinary => "memcache_binary",
            Self::Redis => "redis",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives a conversation to completion.
///
/// Peeks one client byte to pick a protocol, runs the matching state machine
/// until the conversation ends, then flushes events and releases the readers.
pub async fn run(mut conv: Conversation, limits: RespLimits) {
    let first = match conv.client().peek_n(1).await {
        Ok(bytes) => bytes.first().copied(),
        Err(e) => {
            trace!(conversation = %conv.key(), error = %e, "conversation ended before first byte");
            None
        }
    };

    if let Some(first) = first {
        let protocol = Protocol::from_first_byte(first);
        debug!(conversation = %conv.key(), %protocol, "processing conversation");

        let result = match protocol {
            Protocol::MemcacheBinary => {
                info!(conversation = %conv.key(), "memcache binary protocol not currently handled");
                Ok(())
            }
            Protocol::MemcacheText => mctext::run(&mut conv).await,
            Protocol::Redis => redis::run(&mut conv, &limits).await,
        };

        match result {
            Ok(()) => trace!(conversation = %conv.key(), "conversation completed"),
            Err(e) if e.is_end_of_stream() => {
                trace!(conversation = %conv.key(), "conversation completed");
            }
            Err(e) => debug!(conversation = %conv.key(), error = %e, "conversation terminated"),
        }
    }

    conv.finish();
}
