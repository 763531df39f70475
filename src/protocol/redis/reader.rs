use bytes::Bytes;
use thiserror::Error;

use crate::stream::{ReadError, StreamReader};

const ERROR_REPLY: u8 = b'-';
const STATUS_REPLY: u8 = b'+';
const INT_REPLY: u8 = b':';
const STRING_REPLY: u8 = b'$';
const ARRAY_REPLY: u8 = b'*';

const CRLF_LEN: usize = 2;

/// Bounds applied while parsing RESP frames.
#[derive(Debug, Clone)]
pub struct RespLimits {
    /// Largest bulk string accepted, in bytes.
    pub max_bulk_len: usize,
    /// Largest array accepted, in elements.
    pub max_array_len: usize,
    /// Deepest array nesting accepted in a reply.
    pub max_depth: usize,
    /// Command arguments longer than this are truncated.
    pub max_arg_len: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            max_bulk_len: 512 * 1024 * 1024,
            max_array_len: 1024 * 1024,
            max_depth: 64,
            max_arg_len: 64 * 1024,
        }
    }
}

/// RESP parse failures.
#[derive(Debug, Error)]
pub enum RespError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error("reply is empty")]
    EmptyLine,

    #[error("can't parse reply with tag {tag:?}")]
    UnexpectedTag { tag: char },

    #[error("invalid length {line:?}")]
    InvalidLength { line: String },

    #[error("bulk length {len} exceeds limit {limit}")]
    BulkTooLarge { len: u64, limit: usize },

    #[error("array length {len} exceeds limit {limit}")]
    ArrayTooLarge { len: u64, limit: usize },

    #[error("reply nested deeper than {limit}")]
    TooDeep { limit: usize },

    #[error("bulk string missing terminator")]
    MissingTerminator,

    /// The server answered with an error line. The line has been consumed.
    #[error("error reply: {message}")]
    ErrorReply { message: String },
}

/// RESP frame reader over one direction of a conversation.
pub struct RespReader<'a> {
    stream: &'a mut StreamReader,
    limits: &'a RespLimits,
}

impl<'a> RespReader<'a> {
    pub fn new(stream: &'a mut StreamReader, limits: &'a RespLimits) -> Self {
        Self { stream, limits }
    }

    /// Reads a client command: an array of bulk strings. Nil elements become
    /// empty strings and a nil array yields an empty command.
    pub async fn read_command(&mut self) -> Result<Vec<String>, RespError> {
        let (tag, rest) = self.read_header().await?;
        if tag != ARRAY_REPLY {
            return Err(unexpected(tag));
        }

        let Some(n) = self.array_len(&rest)? else {
            return Ok(Vec::new());
        };

        let mut args = Vec::with_capacity(n.min(64));
        for _ in 0..n {
            args.push(self.read_string().await?.unwrap_or_default());
        }
        Ok(args)
    }

    /// Reads a string-valued reply and returns the payload length without
    /// buffering the payload. `None` means nil.
    pub async fn read_value_len(&mut self) -> Result<Option<usize>, RespError> {
        let (tag, rest) = self.read_header().await?;
        match tag {
            STRING_REPLY => {
                let Some(len) = self.bulk_len(&rest)? else {
                    return Ok(None);
                };
                self.stream.discard(len + CRLF_LEN).await?;
                Ok(Some(len))
            }
            STATUS_REPLY => Ok(Some(rest.len())),
            ARRAY_REPLY if is_nil(&rest) => Ok(None),
            ERROR_REPLY => Err(error_reply(&rest)),
            other => Err(unexpected(other)),
        }
    }

    /// Consumes one reply of any shape.
    ///
    /// A top-level error line fails with [`RespError::ErrorReply`]; error
    /// elements nested in arrays are consumed as ordinary values.
    pub async fn skip_reply(&mut self) -> Result<(), RespError> {
        // Remaining element counts of the arrays currently open.
        let mut open: Vec<usize> = Vec::new();

        loop {
            let (tag, rest) = self.read_header().await?;
            match tag {
                ERROR_REPLY if open.is_empty() => return Err(error_reply(&rest)),
                ERROR_REPLY | STATUS_REPLY | INT_REPLY => {}
                STRING_REPLY => {
                    if let Some(len) = self.bulk_len(&rest)? {
                        self.stream.discard(len + CRLF_LEN).await?;
                    }
                }
                ARRAY_REPLY => {
                    if let Some(n) = self.array_len(&rest)? {
                        if n > 0 {
                            if open.len() >= self.limits.max_depth {
                                return Err(RespError::TooDeep {
                                    limit: self.limits.max_depth,
                                });
                            }
                            open.push(n);
                            continue;
                        }
                    }
                }
                other => return Err(unexpected(other)),
            }

            // One element finished; close every array it completes.
            loop {
                match open.last_mut() {
                    None => return Ok(()),
                    Some(remaining) => {
                        *remaining -= 1;
                        if *remaining > 0 {
                            break;
                        }
                        open.pop();
                    }
                }
            }
        }
    }

    /// Reads one element of a command array.
    async fn read_string(&mut self) -> Result<Option<String>, RespError> {
        let (tag, rest) = self.read_header().await?;
        match tag {
            STRING_REPLY => {
                let Some(len) = self.bulk_len(&rest)? else {
                    return Ok(None);
                };

                let keep = len.min(self.limits.max_arg_len);
                let data = self.stream.read_n(keep).await?;
                if keep < len {
                    self.stream.discard(len - keep + CRLF_LEN).await?;
                } else {
                    let crlf = self.stream.read_n(CRLF_LEN).await?;
                    if &crlf[..] != b"\r\n" {
                        return Err(RespError::MissingTerminator);
                    }
                }
                Ok(Some(String::from_utf8_lossy(&data).into_owned()))
            }
            STATUS_REPLY | INT_REPLY => Ok(Some(String::from_utf8_lossy(&rest).into_owned())),
            ERROR_REPLY => Err(error_reply(&rest)),
            other => Err(unexpected(other)),
        }
    }

    /// Reads a reply line and splits off its type tag.
    async fn read_header(&mut self) -> Result<(u8, Bytes), RespError> {
        let line = self.stream.read_line().await?;
        let Some(&tag) = line.first() else {
            return Err(RespError::EmptyLine);
        };
        Ok((tag, line.slice(1..)))
    }

    fn bulk_len(&self, rest: &[u8]) -> Result<Option<usize>, RespError> {
        let Some(len) = parse_len(rest)? else {
            return Ok(None);
        };
        match usize::try_from(len) {
            Ok(n) if n <= self.limits.max_bulk_len => Ok(Some(n)),
            _ => Err(RespError::BulkTooLarge {
                len,
                limit: self.limits.max_bulk_len,
            }),
        }
    }

    fn array_len(&self, rest: &[u8]) -> Result<Option<usize>, RespError> {
        let Some(len) = parse_len(rest)? else {
            return Ok(None);
        };
        match usize::try_from(len) {
            Ok(n) if n <= self.limits.max_array_len => Ok(Some(n)),
            _ => Err(RespError::ArrayTooLarge {
                len,
                limit: self.limits.max_array_len,
            }),
        }
    }
}

fn is_nil(rest: &[u8]) -> bool {
    rest == b"-1"
}

/// Parses a length field; `-1` is nil.
fn parse_len(rest: &[u8]) -> Result<Option<u64>, RespError> {
    if is_nil(rest) {
        return Ok(None);
    }
    std::str::from_utf8(rest)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| RespError::InvalidLength {
            line: String::from_utf8_lossy(rest).into_owned(),
        })
}

fn error_reply(rest: &[u8]) -> RespError {
    RespError::ErrorReply {
        message: String::from_utf8_lossy(rest).into_owned(),
    }
}

fn unexpected(tag: u8) -> RespError {
    RespError::UnexpectedTag {
        tag: char::from(tag),
    }
}
