use std::fmt;

use crate::error::InvalidChannel;

/// Longest identifier PostgreSQL accepts without truncation (NAMEDATALEN - 1).
pub const MAX_CHANNEL_BYTES: usize = 63;

/// Validated name of a LISTEN/NOTIFY channel.
///
/// The name is always sent as a quoted identifier, so `LISTEN` matches
/// `pg_notify(name, ...)` byte for byte, including case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel(String);

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidChannel> {
        let name = name.into();
        if name.is_empty() {
            return Err(InvalidChannel::Empty);
        }
        if name.len() > MAX_CHANNEL_BYTES {
            return Err(InvalidChannel::TooLong(name.len()));
        }
        if name.contains('\0') {
            return Err(InvalidChannel::Nul);
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0.replace('"', "\"\""))
    }

    pub fn listen_sql(&self) -> String {
        format!("LISTEN {}", self.quoted())
    }

    pub fn unlisten_sql(&self) -> String {
        format!("UNLISTEN {}", self.quoted())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Channel {
    type Error = InvalidChannel;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Channel {
    type Error = InvalidChannel;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// A single delivery received on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    /// Backend pid of the session that sent the notification.
    pub process_id: u32,
    /// Arrival order on the receiving connection, starting at 0.
    pub sequence: u64,
}
