//! Fan-out Dispatcher Integration Tests

mod common;

use std::sync::Arc;

use common::FakeTransport;
use podcast_agent::core::FanoutDispatcher;
use podcast_agent::domain::{DeliveryOutcome, DigestPayload, NoOpReason};

fn payload() -> DigestPayload {
    DigestPayload {
        subject: "Podcast Digest - May 2, 2024".to_string(),
        body: "Episode 1\n...".to_string(),
        html: None,
        entry_count: 1,
    }
}

fn recipients(list: &[&str]) -> Vec<String> {
    list.iter().map(|r| r.to_string()).collect()
}

#[tokio::test]
async fn test_one_failing_recipient_does_not_block_others() {
    let transport = Arc::new(FakeTransport::rejecting(&["b@example.com"]));
    let dispatcher = FanoutDispatcher::new(transport.clone());

    let outcome = dispatcher
        .deliver(
            &payload(),
            &recipients(&["a@example.com", "b@example.com", "c@example.com"]),
        )
        .await;

    let report = outcome.report().unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].recipient, "b@example.com");
    assert!(outcome.is_success());
    assert_eq!(
        transport.recipients(),
        vec!["a@example.com", "c@example.com"]
    );
}

#[tokio::test]
async fn test_all_failing_is_attempted_but_unsuccessful() {
    let transport = Arc::new(FakeTransport::rejecting(&["a@example.com"]));
    let dispatcher = FanoutDispatcher::new(transport);

    let outcome = dispatcher
        .deliver(&payload(), &recipients(&["a@example.com"]))
        .await;

    assert!(!outcome.is_noop());
    assert!(!outcome.is_success());
}

#[tokio::test]
async fn test_no_recipients_is_noop() {
    let transport = Arc::new(FakeTransport::default());
    let dispatcher = FanoutDispatcher::new(transport.clone());

    let outcome = dispatcher.deliver(&payload(), &[]).await;

    assert_eq!(outcome, DeliveryOutcome::NoOp(NoOpReason::NoRecipients));
    assert!(transport.recipients().is_empty());
}

#[tokio::test]
async fn test_empty_payload_is_noop() {
    let dispatcher = FanoutDispatcher::new(Arc::new(FakeTransport::default()));
    let empty = DigestPayload {
        subject: "Podcast Digest".to_string(),
        body: String::new(),
        html: None,
        entry_count: 0,
    };

    let outcome = dispatcher
        .deliver(&empty, &recipients(&["a@example.com"]))
        .await;
    assert_eq!(outcome, DeliveryOutcome::NoOp(NoOpReason::EmptyPayload));
}

#[tokio::test]
async fn test_duplicate_recipients_receive_once() {
    let transport = Arc::new(FakeTransport::default());
    let dispatcher = FanoutDispatcher::new(transport.clone());

    dispatcher
        .deliver(
            &payload(),
            &recipients(&["a@example.com", "b@example.com", "a@example.com"]),
        )
        .await;

    assert_eq!(
        transport.recipients(),
        vec!["a@example.com", "b@example.com"]
    );
}
