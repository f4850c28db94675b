//! Helpers that emit notifications, used by tests and the `pglisten-notify` tool.

use std::time::Duration;

use sqlx::{Executor, PgPool, Postgres};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::channel::Channel;
use crate::error::NotifyError;

/// Payloads must be strictly shorter than this many bytes.
pub const MAX_PAYLOAD_BYTES: usize = 8000;

/// Sent by [`emit_continuously`] once it is cancelled.
pub const STOP_PAYLOAD: &str = "stop";

pub fn validate_payload(payload: &str) -> Result<(), NotifyError> {
    if payload.len() >= MAX_PAYLOAD_BYTES {
        return Err(NotifyError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }
    Ok(())
}

/// Emit one notification with `pg_notify`.
///
/// With a pool the notification is delivered as soon as the statement
/// returns. Inside a transaction it is delivered on commit.
#[instrument(skip_all, fields(channel = %channel), err)]
pub async fn send_notification<'c, E>(
    executor: E,
    channel: &Channel,
    payload: &str,
) -> Result<(), NotifyError>
where
    E: Executor<'c, Database = Postgres>,
{
    validate_payload(payload)?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(channel.as_str())
        .bind(payload)
        .execute(executor)
        .await?;

    debug!(bytes = payload.len(), "Sent notification");
    Ok(())
}

/// Emit `<prefix>_0` through `<prefix>_<count - 1>`, pausing `delay` between
/// sends. Returns the payloads in the order they were sent.
pub async fn emit_sequence(
    pool: &PgPool,
    channel: &Channel,
    prefix: &str,
    count: usize,
    delay: Duration,
) -> Result<Vec<String>, NotifyError> {
    let mut sent = Vec::with_capacity(count);
    for i in 0..count {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let payload = format!("{prefix}_{i}");
        send_notification(pool, channel, &payload).await?;
        sent.push(payload);
    }
    info!(channel = %channel, count, "Sent notification sequence");
    Ok(sent)
}

/// Emit `<prefix>_<uuid>` every `every` until `shutdown` fires, then send
/// [`STOP_PAYLOAD`]. Returns how many payloads were sent before the stop.
pub async fn emit_continuously(
    pool: &PgPool,
    channel: &Channel,
    prefix: &str,
    every: Duration,
    shutdown: CancellationToken,
) -> Result<u64, NotifyError> {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut sent = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,

            _ = ticker.tick() => {
                let payload = format!("{prefix}_{}", Uuid::new_v4());
                send_notification(pool, channel, &payload).await?;
                sent += 1;
            }
        }
    }

    send_notification(pool, channel, STOP_PAYLOAD).await?;
    info!(channel = %channel, sent, "Stopped emitting notifications");
    Ok(sent)
}
