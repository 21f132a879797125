//! Rebuilds a subscription after its channel reported a failure.
//!
//! The manager marks the subscription `PendingReconnect` and spawns
//! [`supervise`]. After a flat backoff the old subscription is torn down
//! and a new one is created with the same parameters and callback. There
//! is a single attempt; a failed rebuild is reported through a
//! [`RealtimeNotice::ReconnectFailed`] notice and not retried.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::ids::SubscriptionId;
use crate::manager::RealtimeManager;
use crate::notice::RealtimeNotice;

/// Wait `backoff`, then rebuild `previous`.
///
/// Returns the id of the replacement subscription, or `None` if the
/// rebuild was cancelled, made unnecessary, or failed.
pub async fn supervise(
    manager: RealtimeManager,
    previous: SubscriptionId,
    backoff: Duration,
    cancel: CancellationToken,
) -> Option<SubscriptionId> {
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(subscription_id = %previous, "Reconnect cancelled");
            return None;
        }
        _ = tokio::time::sleep(backoff) => {}
    }

    match manager.resubscribe(previous).await {
        Ok(Some(current)) => {
            tracing::info!(
                previous = %previous,
                current = %current,
                "Resubscribed after channel failure"
            );
            manager.publish(RealtimeNotice::Resubscribed { previous, current });
            Some(current)
        }
        Ok(None) => {
            tracing::debug!(subscription_id = %previous, "Subscription gone before reconnect");
            None
        }
        Err(e) => {
            manager.record_error();
            tracing::error!(subscription_id = %previous, error = %e, "Resubscribe failed");
            manager.publish(RealtimeNotice::ReconnectFailed {
                subscription_id: previous,
                error: e.to_string(),
            });
            None
        }
    }
}
