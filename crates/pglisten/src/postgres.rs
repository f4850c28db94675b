use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use sqlx::postgres::{PgListener, PgNotification, PgPoolOptions};
use sqlx::{Executor, PgPool, Row};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::Notification;
use crate::config::DatabaseConfig;
use crate::error::{ConnectionError, OperationalError};
use crate::traits::{Connector, HEARTBEAT_SQL, HandlerId, NotifyHandler, Session};

const COMMAND_BUFFER: usize = 32;

/// Opens listening sessions from a [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: DatabaseConfig,
}

impl ConnectionManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Open a plain pool against the configured database, for senders.
    pub async fn connect_pool(&self, max_connections: u32) -> Result<PgPool, ConnectionError> {
        let options = self.config.connect_options()?;
        PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(self.config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|source| self.connect_error(source))
    }

    #[instrument(skip(self), fields(target = %self.config.target()))]
    pub async fn acquire(&self) -> Result<Connection, ConnectionError> {
        let pool = self.connect_pool(1).await?;
        let mut listener = PgListener::connect_with(&pool)
            .await
            .map_err(|source| self.connect_error(source))?;

        let backend_pid: i32 =
            Executor::fetch_one(&mut listener, sqlx::query("SELECT pg_backend_pid()"))
                .await
                .and_then(|row| row.try_get(0))
                .map_err(|source| self.connect_error(source))?;

        info!(
            backend_pid,
            autocommit = self.config.autocommit,
            "Connected to database"
        );

        Ok(Connection::spawn(
            listener,
            pool,
            backend_pid,
            self.config.autocommit,
        ))
    }

    /// Close a connection. Idempotent.
    pub async fn release(&self, connection: &Connection) {
        connection.close().await;
    }

    fn connect_error(&self, source: sqlx::Error) -> ConnectionError {
        ConnectionError::Connect {
            target: self.config.target(),
            source,
        }
    }
}

#[async_trait]
impl Connector for ConnectionManager {
    type Session = Connection;

    async fn acquire(&self) -> Result<Connection, ConnectionError> {
        ConnectionManager::acquire(self).await
    }

    async fn release(&self, session: &Connection) {
        ConnectionManager::release(self, session).await
    }
}

enum Command {
    Execute {
        sql: String,
        reply: oneshot::Sender<Result<(), OperationalError>>,
    },
    Ping {
        reply: oneshot::Sender<Result<(), OperationalError>>,
    },
    Commit {
        reply: oneshot::Sender<Result<(), OperationalError>>,
    },
    AddHandler {
        handler: NotifyHandler,
        reply: oneshot::Sender<HandlerId>,
    },
    RemoveHandler {
        id: HandlerId,
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// An exclusive PostgreSQL session.
///
/// The socket is owned by a driver task which executes statements on behalf
/// of this handle and invokes notify handlers as deliveries arrive. Handlers
/// therefore run on the driver task, never on the caller's task.
pub struct Connection {
    commands: mpsc::Sender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
    autocommit: bool,
    backend_pid: i32,
}

impl Connection {
    fn spawn(listener: PgListener, pool: PgPool, backend_pid: i32, autocommit: bool) -> Self {
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let driver = Driver {
            listener,
            pool,
            commands: receiver,
            handlers: Vec::new(),
            next_handler_id: 0,
            sequence: 0,
            autocommit,
            in_transaction: false,
            lost: None,
            backend_pid,
        };

        Self {
            commands,
            driver: Mutex::new(Some(tokio::spawn(driver.run()))),
            closed: AtomicBool::new(false),
            autocommit,
            backend_pid,
        }
    }

    /// Server process id of this session.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OperationalError> {
        if self.is_closed() {
            return Err(OperationalError::SessionClosed);
        }
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| OperationalError::SessionClosed)?;
        response.await.map_err(|_| OperationalError::SessionClosed)
    }
}

#[async_trait]
impl Session for Connection {
    async fn execute(&self, sql: &str) -> Result<(), OperationalError> {
        let sql = sql.to_string();
        self.request(|reply| Command::Execute { sql, reply }).await?
    }

    async fn commit(&self) -> Result<(), OperationalError> {
        self.request(|reply| Command::Commit { reply }).await?
    }

    async fn add_notify_handler(
        &self,
        handler: NotifyHandler,
    ) -> Result<HandlerId, OperationalError> {
        self.request(|reply| Command::AddHandler { handler, reply })
            .await
    }

    async fn remove_notify_handler(&self, id: HandlerId) -> Result<bool, OperationalError> {
        self.request(|reply| Command::RemoveHandler { id, reply })
            .await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Close { reply }).await.is_ok() {
            let _ = done.await;
        }

        let driver = self.driver.lock().take();
        if let Some(driver) = driver
            && let Err(e) = driver.await
        {
            warn!(error = %e, "Connection driver ended abnormally");
        }
        debug!(backend_pid = self.backend_pid, "Connection closed");
    }

    fn autocommit(&self) -> bool {
        self.autocommit
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn ping(&self) -> Result<(), OperationalError> {
        self.request(|reply| Command::Ping { reply }).await?
    }
}

enum Event {
    Command(Option<Command>),
    Received(Result<Option<PgNotification>, sqlx::Error>),
}

struct Driver {
    listener: PgListener,
    pool: PgPool,
    commands: mpsc::Receiver<Command>,
    handlers: Vec<(HandlerId, NotifyHandler)>,
    next_handler_id: u64,
    sequence: u64,
    autocommit: bool,
    in_transaction: bool,
    /// Set once the session drops. `PgListener` would silently reconnect on
    /// the next call, so nothing touches the listener after this.
    lost: Option<String>,
    backend_pid: i32,
}

impl Driver {
    async fn run(mut self) {
        let close_reply = loop {
            let event = tokio::select! {
                biased;

                command = self.commands.recv() => Event::Command(command),

                received = self.listener.try_recv(), if self.lost.is_none() => {
                    Event::Received(received)
                }
            };

            match event {
                Event::Received(received) => self.on_received(received),
                Event::Command(None) => break None,
                Event::Command(Some(command)) => {
                    if let Some(reply) = self.handle(command).await {
                        break Some(reply);
                    }
                }
            }
        };

        let Driver {
            listener,
            pool,
            backend_pid,
            ..
        } = self;
        drop(listener);
        pool.close().await;
        debug!(backend_pid, "Connection driver stopped");

        if let Some(reply) = close_reply {
            let _ = reply.send(());
        }
    }

    /// Returns the reply channel when the command asks the driver to stop.
    async fn handle(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Execute { sql, reply } => {
                let result = self.execute(&sql).await;
                let _ = reply.send(result);
            }
            Command::Ping { reply } => {
                let _ = reply.send(self.ping().await);
            }
            Command::Commit { reply } => {
                let _ = reply.send(self.commit().await);
            }
            Command::AddHandler { handler, reply } => {
                let id = HandlerId(self.next_handler_id);
                self.next_handler_id += 1;
                self.handlers.push((id, handler));
                let _ = reply.send(id);
            }
            Command::RemoveHandler { id, reply } => {
                self.drain_in_flight().await;
                let before = self.handlers.len();
                self.handlers.retain(|(handler_id, _)| *handler_id != id);
                let _ = reply.send(self.handlers.len() != before);
            }
            Command::Close { reply } => return Some(reply),
        }
        None
    }

    /// Dispatch every notification committed before this call.
    ///
    /// The server writes pending notifications ahead of the reply to any
    /// statement, so after one round-trip they all sit in the client buffer.
    async fn drain_in_flight(&mut self) {
        if self.lost.is_some() {
            return;
        }
        let synced = Executor::execute(&mut self.listener, sqlx::raw_sql(HEARTBEAT_SQL)).await;
        self.drain_buffered();
        if let Err(e) = synced
            && self.lost.is_none()
        {
            self.mark_lost(e.to_string());
        }
    }

    /// Dispatch every notification that already reached this session.
    fn drain_buffered(&mut self) {
        while self.lost.is_none() {
            match self.listener.try_recv().now_or_never() {
                Some(received) => self.on_received(received),
                None => break,
            }
        }
    }

    fn on_received(&mut self, received: Result<Option<PgNotification>, sqlx::Error>) {
        match received {
            Ok(Some(notification)) => self.dispatch(notification),
            Ok(None) => self.mark_lost("connection closed by server".to_string()),
            Err(e) => self.mark_lost(e.to_string()),
        }
    }

    fn dispatch(&mut self, notification: PgNotification) {
        let notification = Notification {
            channel: notification.channel().to_string(),
            payload: notification.payload().to_string(),
            process_id: notification.process_id(),
            sequence: self.sequence,
        };
        self.sequence += 1;

        for (_, handler) in &self.handlers {
            handler(&notification);
        }
    }

    fn mark_lost(&mut self, reason: String) {
        error!(backend_pid = self.backend_pid, reason = %reason, "Database session lost");
        self.lost = Some(reason);
    }

    fn ensure_alive(&self) -> Result<(), OperationalError> {
        match &self.lost {
            Some(reason) => Err(OperationalError::SessionLost(reason.clone())),
            None => Ok(()),
        }
    }

    async fn begin_if_needed(&mut self) -> Result<(), OperationalError> {
        if !self.autocommit && !self.in_transaction {
            Executor::execute(&mut self.listener, sqlx::raw_sql("BEGIN")).await?;
            self.in_transaction = true;
        }
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<(), OperationalError> {
        self.ensure_alive()?;
        self.begin_if_needed().await?;
        Executor::execute(&mut self.listener, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    /// Never opens a transaction: an idle-in-transaction session would hold
    /// back every delivery until the next commit.
    async fn ping(&mut self) -> Result<(), OperationalError> {
        self.ensure_alive()?;
        let row = Executor::fetch_one(&mut self.listener, sqlx::query(HEARTBEAT_SQL)).await?;
        let value: i32 = row.try_get(0)?;
        if value != 1 {
            return Err(OperationalError::UnexpectedHeartbeat(value));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), OperationalError> {
        self.ensure_alive()?;
        if self.in_transaction {
            self.in_transaction = false;
            Executor::execute(&mut self.listener, sqlx::raw_sql("COMMIT")).await?;
        }
        Ok(())
    }
}
