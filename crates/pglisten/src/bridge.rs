use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::channel::{Channel, Notification};
use crate::error::OperationalError;
use crate::queue::NotificationQueue;
use crate::traits::{HandlerId, NotifyHandler, Session};

/// Moves deliveries for one channel from a session into a [`NotificationQueue`].
///
/// The installed callback runs on the session's delivery context and only
/// calls [`NotificationQueue::push`], which is safe from any thread.
pub struct NotificationBridge {
    channel: Channel,
    queue: NotificationQueue,
    handler: Option<HandlerId>,
    subscribed: bool,
}

impl NotificationBridge {
    pub fn new(channel: Channel, queue: NotificationQueue) -> Self {
        Self {
            channel,
            queue,
            handler: None,
            subscribed: false,
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn queue(&self) -> &NotificationQueue {
        &self.queue
    }

    pub fn is_registered(&self) -> bool {
        self.handler.is_some()
    }

    /// Install the delivery callback, then `LISTEN` on the channel.
    ///
    /// The callback goes in first so nothing delivered right after `LISTEN`
    /// can slip past it.
    #[instrument(skip_all, fields(channel = %self.channel))]
    pub async fn register<S>(&mut self, session: &S) -> Result<(), OperationalError>
    where
        S: Session + ?Sized,
    {
        if self.handler.is_some() {
            return Err(OperationalError::AlreadyRegistered(
                self.channel.to_string(),
            ));
        }

        let id = session.add_notify_handler(self.handler()).await?;
        self.handler = Some(id);

        run_statement(session, &self.channel.listen_sql()).await?;
        self.subscribed = true;

        debug!("Subscribed to channel");
        Ok(())
    }

    /// Remove the delivery callback, then `UNLISTEN`. Idempotent.
    #[instrument(skip_all, fields(channel = %self.channel))]
    pub async fn unregister<S>(&mut self, session: &S) -> Result<(), OperationalError>
    where
        S: Session + ?Sized,
    {
        if let Some(id) = self.handler.take() {
            session.remove_notify_handler(id).await?;
        }

        if self.subscribed {
            self.subscribed = false;
            run_statement(session, &self.channel.unlisten_sql()).await?;
            debug!("Unsubscribed from channel");
        }
        Ok(())
    }

    fn handler(&self) -> NotifyHandler {
        let channel = self.channel.clone();
        let queue = self.queue.clone();

        Arc::new(move |notification: &Notification| {
            if notification.channel != channel.as_str() {
                return;
            }
            trace!(
                channel = %notification.channel,
                sequence = notification.sequence,
                sender = notification.process_id,
                "Received notification"
            );
            queue.push(notification.payload.as_str());
        })
    }
}

/// Execute a statement and make it take effect, committing when the session
/// is not in autocommit mode.
async fn run_statement<S>(session: &S, sql: &str) -> Result<(), OperationalError>
where
    S: Session + ?Sized,
{
    session.execute(sql).await?;
    if !session.autocommit() {
        session.commit().await?;
    }
    Ok(())
}
