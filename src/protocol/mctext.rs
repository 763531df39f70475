//! Memcached text protocol.
//!
//! Only retrievals produce [`EventType::GetHit`] events; every other command
//! is followed just far enough to stay in sync with the server.

use std::borrow::Cow;
use std::time::SystemTime;

use bytes::Bytes;
use tracing::trace;

use super::conversation::Conversation;
use super::event::{Event, EventType};
use super::ProtocolError;

const CRLF_LEN: usize = 2;
const NOREPLY: &str = "noreply";

/// Runs the memcached text state machine until the conversation ends.
pub async fn run(conv: &mut Conversation) -> Result<(), ProtocolError> {
    trace!(conversation = %conv.key(), "processing as memcache text protocol");

    loop {
        let line = conv.client().read_line().await?;
        if line.is_empty() {
            continue;
        }
        let start = conv.client().seen();
        handle_command(conv, &line, start).await?;
    }
}

async fn handle_command(
    conv: &mut Conversation,
    line: &Bytes,
    start: SystemTime,
) -> Result<(), ProtocolError> {
    let line = String::from_utf8_lossy(line);
    let fields: Vec<&str> = line.split(' ').collect();
    let Some((&command, args)) = fields.split_first() else {
        return Ok(());
    };
    trace!(conversation = %conv.key(), command, "read command");

    match command {
        "get" | "gets" => handle_get(conv, args, start).await,
        "set" | "add" | "replace" | "append" | "prepend" | "cas" => handle_store(conv, args).await,
        "quit" => Ok(()),
        _ if args.last() == Some(&NOREPLY) => Ok(()),
        _ => discard_response(conv).await,
    }
}

/// Follows `VALUE` records until the terminating line.
async fn handle_get(
    conv: &mut Conversation,
    keys: &[&str],
    start: SystemTime,
) -> Result<(), ProtocolError> {
    if keys.is_empty() {
        return discard_response(conv).await;
    }

    loop {
        let line = conv.server().read_line().await?;
        let line = String::from_utf8_lossy(&line);
        let Some(value) = ValueHeader::parse(&line)? else {
            return Ok(());
        };

        conv.server().discard(value.size.saturating_add(CRLF_LEN)).await?;
        let end = conv.server().seen();
        conv.add_event(Event::new(
            EventType::GetHit,
            value.key,
            value.size as u64,
            start,
            end,
        ));
    }
}

/// Skips the client payload of a storage command and its status reply.
async fn handle_store(conv: &mut Conversation, args: &[&str]) -> Result<(), ProtocolError> {
    let Some(size) = args.get(3).and_then(|s| s.parse::<usize>().ok()) else {
        return discard_response(conv).await;
    };

    conv.client().discard(size.saturating_add(CRLF_LEN)).await?;

    if args.last() == Some(&NOREPLY) {
        return Ok(());
    }
    discard_response(conv).await
}

async fn discard_response(conv: &mut Conversation) -> Result<(), ProtocolError> {
    let line = conv.server().read_line().await?;
    trace!(conversation = %conv.key(), response = %String::from_utf8_lossy(&line), "discarded response");
    Ok(())
}

/// `VALUE <key> <flags> <bytes> [<cas unique>]`
struct ValueHeader<'a> {
    key: Cow<'a, str>,
    size: usize,
}

impl<'a> ValueHeader<'a> {
    /// Returns `None` for any line that is not a value record.
    fn parse(line: &'a str) -> Result<Option<Self>, ProtocolError> {
        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() < 4 || fields[0] != "VALUE" {
            return Ok(None);
        }

        let size = fields[3]
            .parse::<usize>()
            .map_err(|_| ProtocolError::Malformed {
                what: "value size",
                line: line.to_string(),
            })?;

        Ok(Some(Self {
            key: Cow::Borrowed(fields[1]),
            size,
        }))
    }
}
