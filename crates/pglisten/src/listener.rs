use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bridge::NotificationBridge;
use crate::channel::Channel;
use crate::config::ListenerConfig;
use crate::error::{ListenError, OperationalError};
use crate::queue::NotificationQueue;
use crate::traits::{Connector, Session};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Init,
    Listening,
    Cancelling,
    Closed,
}

/// Subscribes one channel on one session and keeps the session alive until
/// cancelled.
///
/// Lifecycle: acquire, register, heartbeat until cancelled, then unregister,
/// `UNLISTEN` and release in that order. Cancellation is a normal stop and
/// `run` returns `Ok(())`. A failed heartbeat tears down and returns
/// [`ListenError::Operational`]; there is no reconnection, callers that want
/// one can run a new loop with the same queue.
pub struct ListenerLoop<C: Connector> {
    connector: C,
    bridge: NotificationBridge,
    config: ListenerConfig,
    state: watch::Sender<ListenerState>,
}

impl<C: Connector> ListenerLoop<C> {
    pub fn new(
        connector: C,
        channel: Channel,
        queue: NotificationQueue,
        config: ListenerConfig,
    ) -> Self {
        let (state, _) = watch::channel(ListenerState::Init);
        Self {
            connector,
            bridge: NotificationBridge::new(channel, queue),
            config,
            state,
        }
    }

    pub fn channel(&self) -> &Channel {
        self.bridge.channel()
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Observe state transitions, including after `run` consumed the loop.
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    #[instrument(skip_all, fields(channel = %self.bridge.channel()))]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), ListenError> {
        let channel = self.bridge.channel().to_string();

        // A connect that is already done wins over a pending cancellation.
        let acquired = tokio::select! {
            biased;

            acquired = self.connector.acquire() => Some(acquired),

            _ = shutdown.cancelled() => None,
        };

        let session = match acquired {
            None => {
                info!(channel = %channel, "Listener cancelled while connecting");
                self.set_state(ListenerState::Closed);
                return Ok(());
            }
            Some(Ok(session)) => session,
            Some(Err(e)) => {
                error!(channel = %channel, error = %e, "Failed to connect listener");
                self.set_state(ListenerState::Closed);
                return Err(e.into());
            }
        };

        if let Err(e) = self.bridge.register(&session).await {
            error!(channel = %channel, error = %e, "Failed to subscribe");
            self.teardown(&session).await;
            return Err(ListenError::operational(channel, e));
        }

        self.set_state(ListenerState::Listening);
        info!(channel = %channel, "Listening for notifications");

        match self.heartbeat(&session, &shutdown).await {
            Ok(()) => {
                self.set_state(ListenerState::Cancelling);
                info!(channel = %channel, "Listener cancelled, shutting down");
                self.teardown(&session).await;
                Ok(())
            }
            Err(e) => {
                error!(channel = %channel, error = %e, "Listener session failed");
                self.teardown(&session).await;
                Err(ListenError::operational(channel, e))
            }
        }
    }

    /// Probe the session every interval until cancelled. The first probe
    /// fires immediately.
    async fn heartbeat(
        &self,
        session: &C::Session,
        shutdown: &CancellationToken,
    ) -> Result<(), OperationalError> {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => return Ok(()),

                _ = interval.tick() => {
                    session.ping().await?;
                    trace!("Heartbeat ok");
                }
            }
        }
    }

    async fn teardown(&mut self, session: &C::Session) {
        if self.state() == ListenerState::Closed {
            return;
        }

        if let Err(e) = self.bridge.unregister(session).await {
            warn!(error = %e, "Failed to unsubscribe cleanly");
        }
        self.connector.release(session).await;
        self.set_state(ListenerState::Closed);
        info!("Listener closed");
    }

    fn set_state(&self, state: ListenerState) {
        let previous = self.state.send_replace(state);
        debug!(from = ?previous, to = ?state, "Listener state changed");
    }
}
