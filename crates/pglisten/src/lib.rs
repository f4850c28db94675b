//! PostgreSQL LISTEN/NOTIFY bridge.
//!
//! A [`ListenerLoop`] holds one session, subscribes to one channel and keeps
//! the session alive with a heartbeat. Deliveries arrive on the session's
//! driver task and are handed to a [`NotificationQueue`] that the application
//! drains at its own pace.

mod bridge;
mod channel;
mod config;
mod error;
mod listener;
pub mod notify;
mod postgres;
mod queue;
mod traits;

#[cfg(test)]
mod testing;

pub use bridge::NotificationBridge;
pub use channel::{Channel, MAX_CHANNEL_BYTES, Notification};
pub use config::{DatabaseConfig, ListenerConfig, OverflowPolicy, QueueConfig};
pub use error::{ConnectionError, InvalidChannel, ListenError, NotifyError, OperationalError};
pub use listener::{ListenerLoop, ListenerState};
pub use postgres::{Connection, ConnectionManager};
pub use queue::NotificationQueue;
pub use traits::{Connector, HEARTBEAT_SQL, HandlerId, NotifyHandler, Session};
