//! Common test utilities for end-to-end tests against a PostgreSQL instance
//! running inside testcontainers.

use std::future::Future;
use std::time::Duration;

use anyhow::{Context, anyhow};
use pglisten::notify::send_notification;
use pglisten::{
    Channel, ConnectionManager, DatabaseConfig, ListenerConfig, ListenerLoop, NotificationQueue,
};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use testcontainers_modules::postgres::Postgres;
use testcontainers_modules::testcontainers::ContainerAsync;
use testcontainers_modules::testcontainers::runners::AsyncRunner;
use uuid::Uuid;

const DB_NAME: &str = "pglisten_test";
const DB_USER: &str = "postgres";
const DB_PASSWORD: &str = "postgres";

/// Harness that owns a fresh PostgreSQL container and a pool for senders.
pub struct TestHarness {
    pub pool: PgPool,
    pub database: DatabaseConfig,
    _container: ContainerAsync<Postgres>,
}

impl TestHarness {
    pub async fn new() -> Self {
        init_tracing();

        let container = Postgres::default()
            .with_db_name(DB_NAME)
            .with_user(DB_USER)
            .with_password(DB_PASSWORD)
            .start()
            .await
            .expect("Failed to start PostgreSQL container");

        let host_port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("Failed to get PostgreSQL port");

        let database = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: host_port,
            user: DB_USER.to_string(),
            password: DB_PASSWORD.to_string(),
            name: DB_NAME.to_string(),
            ..Default::default()
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(database.connect_options().expect("Invalid test database config"))
            .await
            .expect("Failed to connect to test database");

        TestHarness {
            pool,
            database,
            _container: container,
        }
    }

    /// Connection manager whose sessions carry a unique application name, so
    /// tests can find them in `pg_stat_activity`.
    pub fn manager(&self) -> (ConnectionManager, String) {
        let application_name = format!("pglisten-test-{}", Uuid::new_v4().simple());
        let config = DatabaseConfig {
            application_name: application_name.clone(),
            ..self.database.clone()
        };
        (ConnectionManager::new(config), application_name)
    }

    /// Listener loop with a fast heartbeat.
    pub fn listener(
        &self,
        channel: &Channel,
        queue: &NotificationQueue,
    ) -> (ListenerLoop<ConnectionManager>, String) {
        let (manager, application_name) = self.manager();
        let listener = ListenerLoop::new(
            manager,
            channel.clone(),
            queue.clone(),
            ListenerConfig {
                heartbeat_interval_ms: 100,
            },
        );
        (listener, application_name)
    }

    pub async fn send(&self, channel: &Channel, payload: &str) -> anyhow::Result<()> {
        send_notification(&self.pool, channel, payload)
            .await
            .context("send notification")
    }

    /// Number of server sessions opened with `application_name`.
    pub async fn sessions_named(&self, application_name: &str) -> anyhow::Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM pg_stat_activity WHERE application_name = $1",
        )
        .bind(application_name)
        .fetch_one(&self.pool)
        .await
        .context("count sessions")
    }

    /// Terminate every server session opened with `application_name`.
    pub async fn terminate_sessions(&self, application_name: &str) -> anyhow::Result<()> {
        sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE application_name = $1",
        )
        .bind(application_name)
        .execute(&self.pool)
        .await
        .context("terminate sessions")?;
        Ok(())
    }

    /// Wait until the named session shows up as listening, so a notification
    /// sent afterwards is guaranteed to be delivered.
    pub async fn wait_until_listening(&self, application_name: &str) -> anyhow::Result<()> {
        wait_until(Duration::from_secs(10), Duration::from_millis(25), || async {
            let listening: i64 = sqlx::query_scalar(
                "SELECT count(*) FROM pg_stat_activity \
                 WHERE application_name = $1 AND query ILIKE 'SELECT 1%'",
            )
            .bind(application_name)
            .fetch_one(&self.pool)
            .await?;
            Ok(listening > 0)
        })
        .await
        .context("listener never started its heartbeat")
    }
}

/// A channel name unique to one test.
pub fn unique_channel(prefix: &str) -> Channel {
    Channel::new(format!("{prefix}_{}", Uuid::new_v4().simple())).expect("valid channel name")
}

/// Poll `check` every `interval` until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, interval: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!("condition not met within {:?}", timeout));
        }
        tokio::time::sleep(interval).await;
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pglisten=debug")),
        )
        .with_test_writer()
        .try_init();
}
