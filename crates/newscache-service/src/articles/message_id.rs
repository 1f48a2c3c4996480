use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Longest message-id a client may ask for, brackets included.
pub const MAX_MESSAGE_ID_LEN: usize = 250;

/// Why a string is not a usable message-id.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum InvalidMessageId {
    #[error("message-id must be enclosed in angle brackets")]
    Brackets,
    #[error("message-id has no `@`")]
    MissingAt,
    #[error("message-id contains whitespace or control characters")]
    Whitespace,
    #[error("message-id is longer than {MAX_MESSAGE_ID_LEN} bytes")]
    TooLong,
}

/// A syntactically valid message-id, like `<part@domain>`.
///
/// Message-ids are used as cache keys, so anything that is not shaped like one is rejected
/// before it ever reaches the cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidMessageId> {
        let s = s.into();
        Self::validate(&s)?;
        Ok(Self(s))
    }

    fn validate(s: &str) -> Result<(), InvalidMessageId> {
        if s.len() > MAX_MESSAGE_ID_LEN {
            return Err(InvalidMessageId::TooLong);
        }
        let inner = s
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .ok_or(InvalidMessageId::Brackets)?;
        if inner.bytes().any(|b| b.is_ascii_whitespace() || b.is_ascii_control()) {
            return Err(InvalidMessageId::Whitespace);
        }
        if inner.contains(['<', '>']) {
            return Err(InvalidMessageId::Brackets);
        }
        match inner.split_once('@') {
            Some((left, right)) if !left.is_empty() && !right.is_empty() => Ok(()),
            _ => Err(InvalidMessageId::MissingAt),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for MessageId {
    type Err = InvalidMessageId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
