/// Connection Audit Module
///
/// Connection attempts, successes, failures and retries are appended to the
/// `connection_audit_log` table for compliance. Emitters push onto an unbounded
/// channel and never wait; a single writer task drains it into the store.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::db::MarketStore;
use crate::models::ConnectionEvent;

/// Cheap, cloneable handle used by the source and the database bootstrap
#[derive(Debug, Clone, Default)]
pub struct AuditSink {
    tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl AuditSink {
    /// Create a sink and the receiver the writer task consumes
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Record an event. Never blocks and never fails the caller.
    pub fn record(&self, event: ConnectionEvent) {
        tracing::debug!(
            service = %event.service,
            event = event.event.as_str(),
            attempt = event.attempt,
            error = event.error.as_deref().unwrap_or(""),
            "connection event"
        );

        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::debug!("audit writer gone, dropping connection event");
            }
        }
    }
}

/// Drain audit events into the store until every sink is dropped
pub fn spawn_audit_writer<S>(store: Arc<S>, mut rx: mpsc::UnboundedReceiver<ConnectionEvent>) -> JoinHandle<()>
where
    S: MarketStore + ?Sized + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = store.log_connection_event(&event).await {
                tracing::warn!(service = %event.service, "failed to write connection audit event: {}", e);
            }
        }
    })
}
