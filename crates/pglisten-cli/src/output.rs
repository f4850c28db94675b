use std::io::{self, Write};

use pglisten::NotificationQueue;
use tokio_util::sync::CancellationToken;

/// Write each payload on its own line until `stop` fires, then flush whatever
/// is still queued. Cancel `stop` only once nothing can push any more.
pub async fn print_payloads<W: Write>(
    queue: &NotificationQueue,
    stop: &CancellationToken,
    out: &mut W,
) -> io::Result<u64> {
    let mut written = 0;
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            payload = queue.pop() => {
                writeln!(out, "{payload}")?;
                out.flush()?;
                written += 1;
            }
        }
    }

    while let Some(payload) = queue.try_pop() {
        writeln!(out, "{payload}")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
