use thiserror::Error;

/// A session to the database could not be established.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Invalid connection url: {0}")]
    InvalidUrl(#[source] sqlx::Error),
}

/// A statement failed or the session was lost while in use.
#[derive(Debug, Error)]
pub enum OperationalError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("Channel '{0}' is already registered on this bridge")]
    AlreadyRegistered(String),

    #[error("Unexpected heartbeat result: {0}")]
    UnexpectedHeartbeat(i32),
}

/// Error returned by [`ListenerLoop::run`](crate::ListenerLoop::run).
#[derive(Debug, Error)]
pub enum ListenError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Listener on channel '{channel}' failed: {source}")]
    Operational {
        channel: String,
        #[source]
        source: OperationalError,
    },
}

impl ListenError {
    pub fn operational(channel: impl Into<String>, source: OperationalError) -> Self {
        Self::Operational {
            channel: channel.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidChannel {
    #[error("Channel name is empty")]
    Empty,

    #[error("Channel name is {0} bytes long, the limit is 63")]
    TooLong(usize),

    #[error("Channel name contains a NUL byte")]
    Nul,
}

/// Sending a notification failed.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    InvalidChannel(#[from] InvalidChannel),

    #[error("Payload is {len} bytes, it must be shorter than {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}
