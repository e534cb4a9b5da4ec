//! Audit-log handler for business events.

use async_trait::async_trait;
use taskhub_outbox::{EventEnvelope, EventHandler};
use tracing::info;

/// Writes one structured log line per delivered event.
///
/// Payloads must be JSON; anything else fails the delivery and follows the
/// normal retry path.
pub struct AuditLogHandler;

#[async_trait]
impl EventHandler for AuditLogHandler {
    fn name(&self) -> &str {
        "audit-log"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let payload: serde_json::Value = serde_json::from_slice(&envelope.payload)
            .map_err(|e| anyhow::anyhow!("malformed payload: {e}"))?;

        info!(
            target: "taskhub::audit",
            record_id = %envelope.record_id,
            event_type = %envelope.event_type,
            idempotency_key = ?envelope.idempotency_key,
            attempt = envelope.attempt,
            payload = %payload,
            "Domain event"
        );
        Ok(())
    }
}
