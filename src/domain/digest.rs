//! Digest payloads, delivery results and the delivery log record.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{Item, SummaryRecord};

/// An episode selected for the digest together with its summary
#[derive(Debug, Clone)]
pub struct DigestEntry {
    pub item: Item,
    pub summary: Option<SummaryRecord>,
}

/// Rendered digest, ready for a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestPayload {
    pub subject: String,
    /// Plain-text rendering, used by every transport
    pub body: String,
    /// HTML alternative for transports that can carry it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    /// Number of episodes rendered into the body
    pub entry_count: usize,
}

impl DigestPayload {
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0 || self.body.trim().is_empty()
    }
}

/// Delivery channel a batch was sent through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Telegram,
    Webhook,
}

impl ChannelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Telegram => "telegram",
            Self::Webhook => "webhook",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "telegram" => Ok(Self::Telegram),
            "webhook" => Ok(Self::Webhook),
            other => Err(format!("unknown channel: {}", other)),
        }
    }
}

/// A single recipient that could not be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientError {
    pub recipient: String,
    pub error: String,
}

/// Aggregate of an attempted fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub errors: Vec<RecipientError>,
}

impl DeliveryReport {
    /// A fan-out succeeds when at least one recipient received the payload
    pub fn is_success(&self) -> bool {
        self.delivered > 0
    }

    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    /// Joined per-recipient errors, if any
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(|e| format!("{}: {}", e.recipient, e.error))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Why a fan-out did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoOpReason {
    NoRecipients,
    EmptyPayload,
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRecipients => f.write_str("no recipients configured"),
            Self::EmptyPayload => f.write_str("nothing to deliver"),
        }
    }
}

/// Result of one fan-out call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Nothing was sent, and nothing went wrong
    NoOp(NoOpReason),
    Attempted(DeliveryReport),
}

impl DeliveryOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Attempted(report) if report.is_success())
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp(_))
    }

    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            Self::Attempted(report) => Some(report),
            Self::NoOp(_) => None,
        }
    }
}

/// Per-channel result stored with a digest batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDelivery {
    pub channel: ChannelKind,
    pub sent: bool,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl ChannelDelivery {
    /// Build the stored record from a fan-out outcome
    pub fn from_outcome(channel: ChannelKind, outcome: &DeliveryOutcome, at: DateTime<Utc>) -> Self {
        match outcome {
            DeliveryOutcome::NoOp(reason) => Self {
                channel,
                sent: false,
                sent_at: None,
                delivered: 0,
                failed: 0,
                error: Some(reason.to_string()),
            },
            DeliveryOutcome::Attempted(report) => Self {
                channel,
                sent: report.is_success(),
                sent_at: report.is_success().then_some(at),
                delivered: report.delivered,
                failed: report.failed,
                error: report.error_summary(),
            },
        }
    }
}

/// One digest delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestBatch {
    /// Assigned by the digest log
    pub id: Option<i64>,
    pub digest_date: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub item_count: usize,
    pub deliveries: Vec<ChannelDelivery>,
}

impl DigestBatch {
    /// True when any channel reached at least one recipient
    pub fn any_sent(&self) -> bool {
        self.deliveries.iter().any(|d| d.sent)
    }

    pub fn delivery(&self, channel: ChannelKind) -> Option<&ChannelDelivery> {
        self.deliveries.iter().find(|d| d.channel == channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_success_requires_one_delivery() {
        let report = DeliveryReport {
            delivered: 0,
            failed: 2,
            errors: vec![],
        };
        assert!(!report.is_success());
        assert!(!DeliveryOutcome::Attempted(report).is_success());
        assert!(!DeliveryOutcome::NoOp(NoOpReason::NoRecipients).is_success());
    }

    #[test]
    fn test_channel_delivery_keeps_partial_errors() {
        let at = Utc::now();
        let outcome = DeliveryOutcome::Attempted(DeliveryReport {
            delivered: 1,
            failed: 1,
            errors: vec![RecipientError {
                recipient: "42".to_string(),
                error: "chat not found".to_string(),
            }],
        });

        let delivery = ChannelDelivery::from_outcome(ChannelKind::Telegram, &outcome, at);
        assert!(delivery.sent);
        assert_eq!(delivery.sent_at, Some(at));
        assert_eq!(delivery.error.as_deref(), Some("42: chat not found"));
    }

    #[test]
    fn test_channel_delivery_from_noop() {
        let delivery = ChannelDelivery::from_outcome(
            ChannelKind::Webhook,
            &DeliveryOutcome::NoOp(NoOpReason::NoRecipients),
            Utc::now(),
        );
        assert!(!delivery.sent);
        assert_eq!(delivery.error.as_deref(), Some("no recipients configured"));
    }
}
