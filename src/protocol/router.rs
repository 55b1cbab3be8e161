//! Type-keyed publish/subscribe router.
//!
//! Handlers subscribe to an envelope type. `send_message` runs every handler
//! for that type in registration order; a handler that fails or panics is
//! logged and skipped without affecting its siblings or the sender.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::FutureExt;

use super::envelope::Envelope;
use crate::error::{Error, Result};

/// Something that consumes envelopes of a given type.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<()>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, envelope: Envelope) -> Result<()> {
        (self)(envelope).await
    }
}

/// Identifies a registration so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    handler: Arc<dyn Handler>,
}

/// Outcome of a single `send_message` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DeliveryReport {
    pub fn matched(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Publish/subscribe dispatcher.
#[derive(Default)]
pub struct Router {
    handlers: RwLock<HashMap<String, Vec<Registration>>>,
    next_id: AtomicU64,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to an envelope type. Many handlers per type are allowed.
    pub fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> HandlerId {
        let message_type = message_type.into();
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers
            .entry(message_type.clone())
            .or_default()
            .push(Registration {
                id,
                handler: Arc::new(handler),
            });

        tracing::debug!("Registered handler {:?} for {}", id, message_type);
        id
    }

    /// Remove a previously registered handler. Returns false if it was unknown.
    pub fn unregister_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let mut removed = false;

        handlers.retain(|_, registrations| {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            removed |= registrations.len() != before;
            !registrations.is_empty()
        });

        removed
    }

    /// Number of handlers subscribed to a type.
    pub fn handler_count(&self, message_type: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(message_type)
            .map_or(0, Vec::len)
    }

    /// Deliver an envelope to every handler registered for its type.
    ///
    /// Never fails: handler errors are logged as delivery errors and counted
    /// in the returned report.
    pub async fn send_message(&self, envelope: Envelope) -> DeliveryReport {
        // Snapshot so handlers may register, unregister or publish while we dispatch.
        let targets: Vec<(HandlerId, Arc<dyn Handler>)> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&envelope.message_type)
                .map(|regs| regs.iter().map(|r| (r.id, r.handler.clone())).collect())
                .unwrap_or_default()
        };

        let mut report = DeliveryReport::default();

        if targets.is_empty() {
            tracing::debug!(
                "No handlers for {} from '{}'",
                envelope.message_type,
                envelope.source
            );
            return report;
        }

        for (id, handler) in targets {
            let outcome = AssertUnwindSafe(handler.handle(envelope.clone()))
                .catch_unwind()
                .await;

            let failure = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => panic_message(panic.as_ref()),
            };

            report.failed += 1;
            let err = Error::Delivery(format!(
                "handler {:?} for {} failed: {}",
                id, envelope.message_type, failure
            ));
            tracing::warn!(
                correlation_id = envelope.correlation_id.as_deref().unwrap_or(""),
                "{}",
                err
            );
        }

        tracing::trace!(
            "Dispatched {} to {} handler(s), {} failed",
            envelope.message_type,
            report.matched(),
            report.failed
        );
        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
