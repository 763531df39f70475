//! Protocol state machines that turn conversation bytes into [`Event`]s.

pub mod conversation;
pub mod event;
pub mod infer;
pub mod mctext;
pub mod redis;

use thiserror::Error;

pub use conversation::{Conversation, ConversationId, EventSink, SubmitError};
pub use event::{Event, EventType};
pub use infer::{run, Protocol};

use self::redis::RespError;
use crate::stream::ReadError;

/// Reasons a conversation stops being analyzed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Resp(#[from] RespError),

    #[error("malformed {what}: {line:?}")]
    Malformed { what: &'static str, line: String },
}

impl ProtocolError {
    /// True when the conversation simply ran out of data.
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            Self::Read(e) => e.is_end_of_stream(),
            Self::Resp(RespError::Read(e)) => e.is_end_of_stream(),
            _ => false,
        }
    }
}
