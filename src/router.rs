//! Notification router.
//!
//! Consumes the multiplexer's notification stream and classifies it:
//! `session.event` fans out on the target session's broadcast,
//! `session.lifecycle` fires registered lifecycle handlers in registration
//! order, and everything else lands on a bounded queue the application can
//! poll. A slow consumer only ever loses its own messages.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::events::{EventKind, LifecycleEvent, SessionEventParams};
use crate::protocol::{JsonRpcNotification, METHOD_SESSION_EVENT, METHOD_SESSION_LIFECYCLE};
use crate::session::SessionRegistry;

/// A lifecycle handler callback.
pub type LifecycleHandler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct LifecycleEntry {
    id: u64,
    /// `None` subscribes to every lifecycle type.
    filter: Option<String>,
    handler: LifecycleHandler,
}

/// Registry of lifecycle handlers, fired in registration order.
#[derive(Default)]
pub(crate) struct LifecycleRegistry {
    entries: RwLock<Vec<LifecycleEntry>>,
    next_id: AtomicU64,
}

impl LifecycleRegistry {
    pub(crate) fn register(
        self: &Arc<Self>,
        filter: Option<String>,
        handler: LifecycleHandler,
    ) -> LifecycleSubscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.push(LifecycleEntry {
            id,
            filter,
            handler,
        });
        LifecycleSubscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn unregister(&self, id: u64) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|entry| entry.id != id);
    }

    pub(crate) fn fire(&self, event: &LifecycleEvent) {
        let handlers: Vec<LifecycleHandler> = {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            entries
                .iter()
                .filter(|entry| match &entry.filter {
                    Some(filter) => filter == &event.kind,
                    None => true,
                })
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };

        for handler in handlers {
            // Handler failures are logged, never propagated.
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!("Lifecycle handler panicked for event `{}`", event.kind);
            }
        }
    }

    /// Drop all handlers (used on stop).
    pub(crate) fn clear(&self) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.clear();
    }
}

/// Handle returned by lifecycle registration; unsubscribes the handler.
pub struct LifecycleSubscription {
    id: u64,
    registry: Weak<LifecycleRegistry>,
}

impl LifecycleSubscription {
    /// Remove the handler. Dropping the subscription does *not*
    /// unsubscribe; only this call does.
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

/// Spawn the router loop. Ends when the notification channel closes.
pub(crate) fn spawn_router(
    mut notifications: mpsc::Receiver<JsonRpcNotification>,
    registry: Arc<SessionRegistry>,
    lifecycle: Arc<LifecycleRegistry>,
    other_tx: mpsc::Sender<JsonRpcNotification>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(notification) = notifications.recv().await {
            match notification.method.as_str() {
                METHOD_SESSION_EVENT => {
                    let params = notification.params.unwrap_or(Value::Null);
                    let parsed: SessionEventParams = match serde_json::from_value(params) {
                        Ok(parsed) => parsed,
                        Err(error) => {
                            warn!("Malformed session.event: {error}");
                            continue;
                        }
                    };

                    if parsed.event.kind == EventKind::SessionStart {
                        check_model_substitution(&registry, &parsed).await;
                    }

                    if !registry.publish(&parsed.session_id, parsed.event).await {
                        trace!(
                            "No route for session {}, dropping event",
                            parsed.session_id
                        );
                    }
                }
                METHOD_SESSION_LIFECYCLE => {
                    let params = notification.params.unwrap_or(Value::Null);
                    let event = LifecycleEvent::from_params(params);
                    lifecycle.fire(&event);
                }
                other => {
                    let other = other.to_string();
                    match other_tx.try_send(notification) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!("Other-notifications queue full, dropping {other}");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            trace!("Other-notifications consumer gone, dropping {other}");
                        }
                    }
                }
            }
        }
        debug!("Router: notification stream closed");
    })
}

/// Warn when the server substituted a different model than requested.
async fn check_model_substitution(registry: &SessionRegistry, params: &SessionEventParams) {
    let Some(requested) = registry.requested_model(&params.session_id).await else {
        return;
    };
    let Some(selected) = params
        .event
        .data
        .get("selectedModel")
        .and_then(Value::as_str)
    else {
        return;
    };
    if selected != requested {
        warn!(
            "Session {} requested model `{requested}` but server selected `{selected}`",
            params.session_id
        );
    }
}
