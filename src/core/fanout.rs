//! Fan-out of one payload to many recipients over a single transport.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::adapters::DeliveryTransport;
use crate::domain::{DeliveryOutcome, DeliveryReport, DigestPayload, NoOpReason, RecipientError};

/// Delivers a payload to each recipient independently
#[derive(Clone)]
pub struct FanoutDispatcher {
    transport: Arc<dyn DeliveryTransport>,
}

impl FanoutDispatcher {
    pub fn new(transport: Arc<dyn DeliveryTransport>) -> Self {
        Self { transport }
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Send `payload` to every recipient, in order.
    ///
    /// A failure for one recipient never stops delivery to the rest. Zero
    /// recipients or an empty payload is a no-op, not a failure.
    #[instrument(skip(self, payload, recipients), fields(transport = self.transport.name()))]
    pub async fn deliver(&self, payload: &DigestPayload, recipients: &[String]) -> DeliveryOutcome {
        let recipients = dedupe_recipients(recipients);

        if recipients.is_empty() {
            debug!("No recipients, skipping delivery");
            return DeliveryOutcome::NoOp(NoOpReason::NoRecipients);
        }
        if payload.is_empty() {
            debug!("Empty payload, skipping delivery");
            return DeliveryOutcome::NoOp(NoOpReason::EmptyPayload);
        }

        let mut report = DeliveryReport::default();
        for recipient in recipients {
            match self.transport.send(payload, recipient).await {
                Ok(()) => {
                    debug!(recipient, "Delivered");
                    report.delivered += 1;
                }
                Err(e) => {
                    warn!(recipient, error = %e, "Delivery failed");
                    report.failed += 1;
                    report.errors.push(RecipientError {
                        recipient: recipient.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            delivered = report.delivered,
            failed = report.failed,
            "Fan-out complete"
        );
        DeliveryOutcome::Attempted(report)
    }
}

/// Trimmed, non-empty recipients with duplicates removed, first occurrence kept
pub fn dedupe_recipients(recipients: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty() && seen.insert(*r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedupe_preserves_order() {
        let input = vec![
            "b".to_string(),
            "a".to_string(),
            " b ".to_string(),
            "".to_string(),
            "c".to_string(),
        ];
        assert_eq!(dedupe_recipients(&input), vec!["b", "a", "c"]);
    }
}
