//! In-memory session that records every command it receives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::Notification;
use crate::error::{ConnectionError, OperationalError};
use crate::traits::{Connector, HandlerId, NotifyHandler, Session};

pub(crate) struct RecordingSession {
    log: Mutex<Vec<String>>,
    handlers: Mutex<Vec<(HandlerId, NotifyHandler)>>,
    next_handler_id: AtomicU64,
    sequence: AtomicU64,
    autocommit: bool,
    closed: AtomicBool,
    fail_heartbeat: AtomicBool,
}

impl RecordingSession {
    pub(crate) fn new() -> Self {
        Self::with_autocommit(true)
    }

    pub(crate) fn without_autocommit() -> Self {
        Self::with_autocommit(false)
    }

    fn with_autocommit(autocommit: bool) -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(0),
            sequence: AtomicU64::new(0),
            autocommit,
            closed: AtomicBool::new(false),
            fail_heartbeat: AtomicBool::new(false),
        }
    }

    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub(crate) fn count(&self, entry: &str) -> usize {
        self.log.lock().iter().filter(|e| *e == entry).count()
    }

    pub(crate) fn position(&self, entry: &str) -> Option<usize> {
        self.log.lock().iter().position(|e| e == entry)
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub(crate) fn fail_heartbeat(&self) {
        self.fail_heartbeat.store(true, Ordering::SeqCst);
    }

    /// Invoke every installed handler, the way a driver would.
    pub(crate) fn deliver(&self, channel: &str, payload: &str) {
        let notification = Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
            process_id: 4242,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
        };
        let handlers: Vec<NotifyHandler> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(&notification);
        }
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().push(entry.into());
    }

    fn ensure_open(&self) -> Result<(), OperationalError> {
        if self.is_closed() {
            return Err(OperationalError::SessionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Session for RecordingSession {
    async fn execute(&self, sql: &str) -> Result<(), OperationalError> {
        self.ensure_open()?;
        self.record(sql);
        if sql == crate::traits::HEARTBEAT_SQL && self.fail_heartbeat.load(Ordering::SeqCst) {
            return Err(OperationalError::SessionLost(
                "terminated by administrator".to_string(),
            ));
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), OperationalError> {
        self.ensure_open()?;
        self.record("commit");
        Ok(())
    }

    async fn add_notify_handler(
        &self,
        handler: NotifyHandler,
    ) -> Result<HandlerId, OperationalError> {
        self.ensure_open()?;
        self.record("add_handler");
        let id = HandlerId(self.next_handler_id.fetch_add(1, Ordering::SeqCst));
        self.handlers.lock().push((id, handler));
        Ok(id)
    }

    async fn remove_notify_handler(&self, id: HandlerId) -> Result<bool, OperationalError> {
        self.ensure_open()?;
        self.record("remove_handler");
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        Ok(handlers.len() != before)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record("close");
        }
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Hands out one shared [`RecordingSession`].
pub(crate) struct RecordingConnector {
    pub(crate) session: Arc<RecordingSession>,
    pub(crate) acquired: AtomicUsize,
    pub(crate) released: AtomicUsize,
    refuse: bool,
    stall: bool,
}

impl RecordingConnector {
    pub(crate) fn new() -> Self {
        Self {
            session: Arc::new(RecordingSession::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            refuse: false,
            stall: false,
        }
    }

    pub(crate) fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    /// Never finishes connecting, like a server that does not answer.
    pub(crate) fn stalling() -> Self {
        Self {
            stall: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl Connector for Arc<RecordingConnector> {
    type Session = Arc<RecordingSession>;

    async fn acquire(&self) -> Result<Self::Session, ConnectionError> {
        if self.stall {
            futures::future::pending::<()>().await;
        }
        if self.refuse {
            return Err(ConnectionError::Connect {
                target: "postgres@localhost:5432/postgres".to_string(),
                source: sqlx::Error::PoolTimedOut,
            });
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(self.session.clone())
    }

    async fn release(&self, session: &Self::Session) {
        self.released.fetch_add(1, Ordering::SeqCst);
        session.close().await;
    }
}
