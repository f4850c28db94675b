//! Seams between the listener loop and the database session.

use std::sync::Arc;

use async_trait::async_trait;

use crate::Notification;
use crate::error::{ConnectionError, OperationalError};

/// Statement used as the liveness probe.
pub const HEARTBEAT_SQL: &str = "SELECT 1";

/// Callback invoked for every notification received on a session.
///
/// Runs on the session's delivery context, not on the caller's task. It must
/// not block and should only hand the notification off.
pub type NotifyHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

/// One exclusive session to the database.
#[async_trait]
pub trait Session: Send + Sync {
    /// Execute a statement whose result rows are discarded.
    async fn execute(&self, sql: &str) -> Result<(), OperationalError>;

    /// Commit the open transaction, if any. A no-op in autocommit mode.
    async fn commit(&self) -> Result<(), OperationalError>;

    /// Install a delivery callback. Returns the id needed to remove it.
    async fn add_notify_handler(
        &self,
        handler: NotifyHandler,
    ) -> Result<HandlerId, OperationalError>;

    /// Remove a delivery callback. Returns false when the id was unknown.
    async fn remove_notify_handler(&self, id: HandlerId) -> Result<bool, OperationalError>;

    /// Close the session. Calling this more than once is a no-op.
    async fn close(&self);

    fn autocommit(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), OperationalError> {
        self.execute(HEARTBEAT_SQL).await
    }
}

/// Scoped acquisition and release of a [`Session`].
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session + 'static;

    async fn acquire(&self) -> Result<Self::Session, ConnectionError>;

    /// Release a session acquired from this connector. Idempotent.
    async fn release(&self, session: &Self::Session) {
        session.close().await;
    }
}

#[async_trait]
impl<S: Session + ?Sized> Session for Arc<S> {
    async fn execute(&self, sql: &str) -> Result<(), OperationalError> {
        (**self).execute(sql).await
    }

    async fn commit(&self) -> Result<(), OperationalError> {
        (**self).commit().await
    }

    async fn add_notify_handler(
        &self,
        handler: NotifyHandler,
    ) -> Result<HandlerId, OperationalError> {
        (**self).add_notify_handler(handler).await
    }

    async fn remove_notify_handler(&self, id: HandlerId) -> Result<bool, OperationalError> {
        (**self).remove_notify_handler(id).await
    }

    async fn close(&self) {
        (**self).close().await
    }

    fn autocommit(&self) -> bool {
        (**self).autocommit()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }

    async fn ping(&self) -> Result<(), OperationalError> {
        (**self).ping().await
    }
}
