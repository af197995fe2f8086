//! Reconnection controller: fixed-delay reopen loop, interruptible by a caller disconnect.

use crate::gateway::connection::{Connection, Connector};
use std::time::Duration;
use tokio::sync::watch;

/// Whether the caller asked to disconnect. A dropped sender counts as a request to stop.
pub(crate) fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Wait for a shutdown request. Resolves immediately once one is pending.
pub(crate) async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if shutdown_requested(shutdown) {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Reopen the connection: wait `delay`, try once, repeat with the same delay until it works.
/// Returns `None` when shutdown is requested meanwhile (terminal, no further attempts).
pub(crate) async fn reconnect(
    connector: &dyn Connector,
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<Box<dyn Connection>> {
    let mut attempt: u32 = 0;
    loop {
        if shutdown_requested(shutdown) {
            return None;
        }
        attempt += 1;
        log::info!("reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_shutdown(shutdown) => return None,
        }
        let res = tokio::select! {
            res = connector.connect() => res,
            _ = wait_shutdown(shutdown) => return None,
        };
        match res {
            Ok(conn) => {
                log::info!("reconnected after {} attempt(s)", attempt);
                return Some(conn);
            }
            Err(e) => log::error!("reconnect attempt {} failed: {}", attempt, e),
        }
    }
}
