//! Background watch loop
//!
//! The loop only knows how to subscribe from a revision, read batches and
//! cancel; [`WatchSource`] supplies those, so the re-subscription logic is the
//! same whether the batches come from etcd or from a scripted test source.

use super::MetastoreEvent;
use crate::common::{OverflowPolicy, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Pause before re-subscribing after the watch stream fails
pub(crate) const WATCH_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// One change read from a subscription
pub(crate) struct WatchedEvent {
    /// Revision the change was made at, if the backend reported it
    pub revision: Option<i64>,
    /// Translated event; a translation error skips the event
    pub event: Result<MetastoreEvent>,
}

pub(crate) enum WatchBatch {
    Events(Vec<WatchedEvent>),
    /// The server ended the subscription. `compact_revision` is non-zero when
    /// the requested start revision is no longer retained.
    Canceled {
        compact_revision: i64,
        reason: String,
    },
}

#[async_trait]
pub(crate) trait WatchSubscription: Send {
    /// Next batch, `Ok(None)` once the stream has ended
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>>;

    /// Best effort
    async fn cancel(&mut self);
}

#[async_trait]
pub(crate) trait WatchSource: Send + Sync + 'static {
    type Subscription: WatchSubscription;

    /// Watch every key under `prefix`, from `start_revision` or from now
    async fn subscribe(
        &mut self,
        prefix: &str,
        start_revision: Option<i64>,
    ) -> Result<Self::Subscription>;
}

/// Where the next subscription starts after the server canceled one
pub(crate) fn resume_revision(next_revision: Option<i64>, compact_revision: i64) -> Option<i64> {
    if compact_revision > 0 {
        match next_revision {
            Some(revision) if revision > compact_revision => Some(revision),
            _ => Some(compact_revision),
        }
    } else {
        next_revision
    }
}

/// State owned by the background watch task
pub(crate) struct WatchLoop<S> {
    pub source: S,
    pub prefix: String,
    pub events: mpsc::Sender<MetastoreEvent>,
    pub overflow_policy: OverflowPolicy,
    pub dropped_events: Arc<AtomicU64>,
    pub cancel: CancellationToken,
    pub backoff: Duration,
}

impl<S: WatchSource> WatchLoop<S> {
    pub async fn run(mut self) {
        let mut next_revision: Option<i64> = None;

        while !self.cancel.is_cancelled() {
            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                res = self.source.subscribe(&self.prefix, next_revision) => res,
            };

            match subscribed {
                Ok(mut subscription) => {
                    tracing::debug!(target: "metastore::watch", prefix = %self.prefix, start_revision = ?next_revision, "watch subscribed");

                    loop {
                        let batch = tokio::select! {
                            biased;
                            _ = self.cancel.cancelled() => {
                                subscription.cancel().await;
                                return;
                            }
                            batch = subscription.next_batch() => batch,
                        };

                        match batch {
                            Ok(Some(WatchBatch::Events(events))) => {
                                for watched in events {
                                    if let Some(revision) = watched.revision {
                                        next_revision = Some(revision + 1);
                                    }
                                    if !self.forward(watched.event).await {
                                        subscription.cancel().await;
                                        return;
                                    }
                                }
                            }
                            Ok(Some(WatchBatch::Canceled {
                                compact_revision,
                                reason,
                            })) => {
                                if compact_revision > 0 {
                                    tracing::warn!(target: "metastore::watch", prefix = %self.prefix, start_revision = ?next_revision, compact_revision, "watch revision compacted, changes before it are lost");
                                } else {
                                    tracing::warn!(target: "metastore::watch", prefix = %self.prefix, reason = %reason, "watch canceled by server");
                                }
                                next_revision = resume_revision(next_revision, compact_revision);
                                break;
                            }
                            Ok(None) => {
                                tracing::warn!(target: "metastore::watch", prefix = %self.prefix, "watch stream closed");
                                break;
                            }
                            Err(e) => {
                                tracing::error!(target: "metastore::watch", prefix = %self.prefix, error = %e, "watch stream failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(target: "metastore::watch", prefix = %self.prefix, error = %e, "failed to subscribe watch");
                }
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    /// Returns `false` once cancellation wins over a blocked send.
    async fn forward(&self, event: Result<MetastoreEvent>) -> bool {
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                tracing::error!(target: "metastore::watch", error = %e, "failed to convert event");
                return true;
            }
        };

        tracing::debug!(target: "metastore::watch", path = %event.path, kind = %event.kind, "received event");
        deliver(
            &self.events,
            event,
            self.overflow_policy,
            &self.cancel,
            &self.dropped_events,
        )
        .await
    }
}

/// Push one event according to the overflow policy.
///
/// Returns `false` only when cancelled while waiting for capacity.
pub(crate) async fn deliver(
    events: &mpsc::Sender<MetastoreEvent>,
    event: MetastoreEvent,
    policy: OverflowPolicy,
    cancel: &CancellationToken,
    dropped_events: &AtomicU64,
) -> bool {
    match policy {
        OverflowPolicy::Block => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                res = events.send(event) => {
                    if let Err(e) = res {
                        tracing::debug!(target: "metastore::watch", path = %e.0.path, "event receiver dropped");
                    }
                    true
                }
            }
        }
        OverflowPolicy::DropNewest => match events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                dropped_events.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "metastore::watch", path = %event.path, kind = %event.kind, "event channel full, dropping event");
                true
            }
            Err(TrySendError::Closed(event)) => {
                tracing::debug!(target: "metastore::watch", path = %event.path, "event receiver dropped");
                true
            }
        },
    }
}
