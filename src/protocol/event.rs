use std::fmt;
use std::time::{Duration, SystemTime};

/// Kind of exchange observed on a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EventType {
    #[default]
    Unknown,
    /// A command that is not a key lookup completed.
    CommandExecuted,
    /// A key lookup returned a value.
    GetHit,
    /// A key lookup found nothing.
    GetMiss,
}

impl EventType {
    /// Returns the canonical log label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::CommandExecuted => "command_executed",
            Self::GetHit => "get_hit",
            Self::GetMiss => "get_miss",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single request/response exchange recovered from a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub key: String,
    /// Value size in bytes, or 0 when not applicable.
    pub size: u64,
    /// Capture time at the end of the request.
    pub start: SystemTime,
    /// Capture time at the end of the response.
    pub end: SystemTime,
}

impl Event {
    pub fn new(
        event_type: EventType,
        key: impl Into<String>,
        size: u64,
        start: SystemTime,
        end: SystemTime,
    ) -> Self {
        Self {
            event_type,
            key: key.into(),
            size,
            start,
            end,
        }
    }

    /// Time between request and response. Zero if capture timestamps went
    /// backwards.
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_millis(1_000);
        let end = start + Duration::from_millis(250);
        let event = Event::new(EventType::GetHit, "k", 5, start, end);
        assert_eq!(event.duration(), Duration::from_millis(250));
    }

    #[test]
    fn test_duration_clamps_backwards_clock() {
        let end = SystemTime::UNIX_EPOCH + Duration::from_secs(1);
        let start = end + Duration::from_secs(1);
        let event = Event::new(EventType::GetMiss, "k", 0, start, end);
        assert_eq!(event.duration(), Duration::ZERO);
    }

    #[test]
    fn test_event_type_labels() {
        assert_eq!(EventType::GetHit.to_string(), "get_hit");
        assert_eq!(EventType::default(), EventType::Unknown);
    }
}
