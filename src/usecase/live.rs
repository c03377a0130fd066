use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::domain::change::TableChange;
use crate::usecase::contracts::{LocalStorage, NotificationSource};
use crate::usecase::feed::NotificationFeed;

enum Next {
    Change,
    Closed,
    Shutdown,
}

async fn next_change(
    changes: &mut broadcast::Receiver<TableChange>,
    shutdown: &mut watch::Receiver<bool>,
) -> Next {
    tokio::select! {
        _ = shutdown.changed() => Next::Shutdown,
        change = changes.recv() => match change {
            Ok(change) => {
                tracing::trace!(table = %change.table, operation = ?change.operation, "table change received");
                Next::Change
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "change feed lagged, refreshing anyway");
                Next::Change
            }
            Err(broadcast::error::RecvError::Closed) => Next::Closed,
        },
    }
}

/// Re-runs the feed pipeline whenever one of the source tables changes.
/// Bursts arriving within the debounce window collapse into one refresh.
#[derive(Debug, Clone, Copy)]
pub struct LiveRefresh {
    debounce: Duration,
}

impl LiveRefresh {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce }
    }

    /// Runs until the change stream closes or `shutdown` fires.
    #[tracing::instrument(skip_all, fields(user_id = %feed.user_id()))]
    pub async fn run<S, L>(
        self,
        mut changes: broadcast::Receiver<TableChange>,
        feed: Arc<NotificationFeed<S, L>>,
        mut shutdown: watch::Receiver<bool>,
    ) where
        S: NotificationSource + ?Sized,
        L: LocalStorage + ?Sized,
    {
        tracing::debug!(debounce_ms = self.debounce.as_millis() as u64, "live refresh started");

        loop {
            match next_change(&mut changes, &mut shutdown).await {
                Next::Change => {}
                Next::Closed => break,
                Next::Shutdown => {
                    tracing::debug!("live refresh stopped by shutdown");
                    return;
                }
            }

            let deadline = Instant::now() + self.debounce;
            let mut coalesced = 1usize;
            let mut closed = false;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    next = next_change(&mut changes, &mut shutdown) => match next {
                        Next::Change => coalesced += 1,
                        Next::Closed => {
                            closed = true;
                            break;
                        }
                        Next::Shutdown => {
                            tracing::debug!("live refresh stopped by shutdown");
                            return;
                        }
                    },
                }
            }

            tracing::debug!(coalesced, "change burst settled, refreshing");
            // Failures are logged by the feed; the next change retries.
            let _ = feed.refresh().await;

            if closed {
                break;
            }
        }

        tracing::debug!("change feed closed, live refresh finished");
    }
}
