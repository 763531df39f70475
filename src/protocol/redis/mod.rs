//! Redis RESP protocol.
//!
//! `GET` is the only command with dedicated handling; every other command is
//! reported as [`EventType::CommandExecuted`] once its reply is consumed.

mod reader;

use std::time::SystemTime;

use tracing::trace;

pub use reader::{RespError, RespLimits, RespReader};

use super::conversation::Conversation;
use super::event::{Event, EventType};
use super::ProtocolError;

/// Runs the Redis state machine until the conversation ends.
pub async fn run(conv: &mut Conversation, limits: &RespLimits) -> Result<(), ProtocolError> {
    trace!(conversation = %conv.key(), "processing as redis protocol");

    loop {
        let request = RespReader::new(conv.client(), limits).read_command().await?;
        let start = conv.client().seen();

        let Some((name, args)) = request.split_first() else {
            trace!(conversation = %conv.key(), "empty command, ending conversation");
            return Ok(());
        };

        let name = name.to_ascii_uppercase();
        match (name.as_str(), args.first()) {
            ("GET", Some(key)) => handle_get(conv, limits, key, start).await?,
            _ => handle_command(conv, limits, &name, args, start).await?,
        }
    }
}

async fn handle_get(
    conv: &mut Conversation,
    limits: &RespLimits,
    key: &str,
    start: SystemTime,
) -> Result<(), ProtocolError> {
    let reply = RespReader::new(conv.server(), limits).read_value_len().await;
    let end = conv.server().seen();

    match reply {
        Ok(None) => conv.add_event(Event::new(EventType::GetMiss, key, 0, start, end)),
        Ok(Some(len)) => {
            conv.add_event(Event::new(EventType::GetHit, key, len as u64, start, end));
        }
        Err(RespError::ErrorReply { message }) => {
            trace!(conversation = %conv.key(), key, %message, "error reply to GET");
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn handle_command(
    conv: &mut Conversation,
    limits: &RespLimits,
    name: &str,
    args: &[String],
    start: SystemTime,
) -> Result<(), ProtocolError> {
    match RespReader::new(conv.server(), limits).skip_reply().await {
        Ok(()) => {}
        Err(RespError::ErrorReply { message }) => {
            trace!(conversation = %conv.key(), command = name, %message, "error reply");
        }
        Err(e) => return Err(e.into()),
    }

    let end = conv.server().seen();
    conv.add_event(Event::new(
        EventType::CommandExecuted,
        args.join(" "),
        0,
        start,
        end,
    ));
    Ok(())
}
