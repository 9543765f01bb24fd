//! Uplink and history failure scenarios

use crate::test_utils::*;
use cmdflow_commanding::{
    ChannelUplink, CommandOptions, CommandingError, QueueError, QueueEvent, HISTORY_UNAVAILABLE,
};
use cmdflow_history::{HistoryLog, SubscriberSettings};
use std::sync::Arc;

#[tokio::test(start_paused = true)]
async fn test_uplink_failure_fails_release() {
    let h = Harness::with_collaborators(
        HistoryLog::new(SubscriberSettings::default()),
        Arc::new(BrokenUplink),
    );
    let mut events = h.service.queue_events();
    let mut w = h.watch();
    let cmd = h.issue("CONT_VERIF_TC", &[], CommandOptions::default());

    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs),
        stages(&[
            ("AcknowledgeQueued", "OK"),
            ("TransmissionConstraints", "NA"),
            ("AcknowledgeReleased", "NOK"),
            ("CommandComplete", "NOK"),
        ])
    );
    let expected = "Uplink failure: Uplink unavailable: link down";
    assert_eq!(message(&attrs, "AcknowledgeReleased").as_deref(), Some(expected));
    assert_eq!(message(&attrs, "CommandComplete").as_deref(), Some(expected));

    let mut rejected = None;
    while let Ok(event) = events.try_recv() {
        if let QueueEvent::CommandRejected { reason, .. } = event {
            rejected = Some(reason);
        }
    }
    assert_eq!(rejected.as_deref(), Some(expected));
}

#[tokio::test(start_paused = true)]
async fn test_history_failure_completes_command() {
    let (uplink, _sent) = ChannelUplink::channel();
    let store = FailingStore::refusing("AcknowledgeReleased_Status");
    let h = Harness::with_collaborators(
        HistoryLog::with_store(Box::new(store), SubscriberSettings::default()),
        Arc::new(uplink),
    );
    let mut w = h.watch();
    let cmd = h.issue("CONT_VERIF_TC", &[], CommandOptions::default());

    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs),
        stages(&[
            ("AcknowledgeQueued", "OK"),
            ("TransmissionConstraints", "NA"),
            ("CommandComplete", "NOK"),
        ])
    );
    assert_eq!(
        message(&attrs, "CommandComplete").as_deref(),
        Some(HISTORY_UNAVAILABLE)
    );
    assert!(h.service.queue("default").unwrap().pending.is_empty());
    assert_eq!(h.bus.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_admission_history_failure_is_reported() {
    let (uplink, _sent) = ChannelUplink::channel();
    let store = FailingStore::refusing("Queue");
    let h = Harness::with_collaborators(
        HistoryLog::with_store(Box::new(store), SubscriberSettings::default()),
        Arc::new(uplink),
    );

    let err = h
        .try_issue("ONE_INT_ARG_TC", &[], CommandOptions::default())
        .unwrap_err();
    assert!(matches!(err, CommandingError::History(_)));
    // nothing is left behind in the queue
    assert!(h.service.queue("default").unwrap().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_control_after_completion() {
    let h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    w.until_complete(&cmd.identity).await;

    let err = h.service.reject_command(&cmd.identity, "alice").unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Queue(QueueError::CommandNotFound(_))
    ));
    let err = h
        .service
        .release_command(&cmd.identity, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Queue(QueueError::CommandNotFound(_))
    ));

    let recorded = h.service.query_history(&cmd.identity).unwrap();
    assert_eq!(completion_count(&recorded), 1);
}
