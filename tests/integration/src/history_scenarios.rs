//! Command history scenarios

use crate::test_utils::*;
use cmdflow_commanding::{CommandOptions, CommandingError, COMMENT_ATTRIBUTE};
use cmdflow_core::Value;
use cmdflow_history::{HistoryError, HistoryFilter};

#[tokio::test(start_paused = true)]
async fn test_external_attribute_after_completion() {
    let h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    w.until_complete(&cmd.identity).await;

    let attr = h
        .service
        .update_history(&cmd.identity, "packetSeqNum", Value::Int(5000))
        .unwrap();
    assert_eq!(attr.name, "packetSeqNum");

    let recorded = h.service.query_history(&cmd.identity).unwrap();
    let last = recorded.last().unwrap();
    assert_eq!(last.name, "packetSeqNum");
    assert_eq!(last.value, Value::Int(5000));
    // still exactly one completion
    assert_eq!(completion_count(&recorded), 1);
}

#[tokio::test(start_paused = true)]
async fn test_protected_and_unknown_updates_are_refused() {
    let h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    w.until_complete(&cmd.identity).await;

    let err = h
        .service
        .update_history(&cmd.identity, "CommandComplete_Status", Value::from("NOK"))
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::History(HistoryError::ProtectedAttribute(_))
    ));

    let mut stranger = cmd.identity.clone();
    stranger.sequence_number += 100;
    let err = h
        .service
        .update_history(&stranger, "packetSeqNum", Value::Int(1))
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::History(HistoryError::UnknownCommand(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_subscription_does_not_replay() {
    let h = Harness::new();
    let mut early = h.watch();
    let first = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    early.until_complete(&first.identity).await;

    let mut late = h.watch();
    assert!(late.drain().is_empty());

    // the full record stays available through a query
    let recorded = h.service.query_history(&first.identity).unwrap();
    assert_eq!(recorded, early.history(&first.identity));

    let second = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    let attrs = late.until_complete(&second.identity).await;
    assert!(late.drain().iter().all(|a| a.command_id != first.identity));
    assert_eq!(attrs[0].name, "Queue");
}

#[tokio::test(start_paused = true)]
async fn test_command_filter() {
    let h = Harness::new();
    let mut all = h.watch();
    let first = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    let mut only_first = h
        .service
        .subscribe_history(HistoryFilter::Command(first.identity.clone()));
    let second = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());

    all.until_complete(&first.identity).await;
    all.until_complete(&second.identity).await;

    let mut received = Vec::new();
    while let Some(attr) = only_first.try_recv() {
        received.push(attr);
    }
    assert!(!received.is_empty());
    assert!(received.iter().all(|a| a.command_id == first.identity));
}

#[tokio::test(start_paused = true)]
async fn test_comment_is_recorded_after_admission() {
    let h = Harness::new();
    let mut w = h.watch();
    let options = CommandOptions {
        comment: Some("pass 42 contingency".to_string()),
        ..CommandOptions::default()
    };
    let cmd = h.issue("ONE_INT_ARG_TC", &[], options);

    let attrs = w.until_complete(&cmd.identity).await;
    let names: Vec<_> = attrs.iter().take(4).map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "Queue",
            "AcknowledgeQueued_Status",
            "AcknowledgeQueued_Time",
            COMMENT_ATTRIBUTE
        ]
    );
    assert_eq!(attrs[3].value, Value::from("pass 42 contingency"));
}

#[tokio::test(start_paused = true)]
async fn test_every_command_completes_once() {
    let mut h = Harness::new();
    let mut w = h.watch();
    let plain = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    let refused = h.issue("CRITICAL_TC1", &[("p1", Value::Int(1))], CommandOptions::default());
    let verified = h.issue("CONT_VERIF_TC", &[], CommandOptions::default());

    // nothing acknowledges the verifiers, so the third one times out
    for cmd in [&plain, &refused, &verified] {
        let attrs = w.until_complete(&cmd.identity).await;
        assert_eq!(completion_count(&attrs), 1, "{}", cmd.identity);
    }
    tokio::time::sleep(tokio::time::Duration::from_secs(10)).await;
    for cmd in [&plain, &refused, &verified] {
        let recorded = h.service.query_history(&cmd.identity).unwrap();
        assert_eq!(completion_count(&recorded), 1);
        assert!(recorded
            .last()
            .is_some_and(|a| a.name.starts_with("CommandComplete_")));
    }
    let sent: Vec<_> = std::iter::from_fn(|| h.sent.try_recv().ok()).collect();
    assert_eq!(sent.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_attributes_serialize_to_json() {
    let h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    let attrs = w.until_complete(&cmd.identity).await;

    let status = attrs
        .iter()
        .find(|a| a.name == "CommandComplete_Status")
        .unwrap();
    let json = serde_json::to_value(status).unwrap();
    assert_eq!(json["name"], "CommandComplete_Status");
    assert_eq!(json["command_id"]["name"], "/REFMDB/SUBSYS1/ONE_INT_ARG_TC");
    assert_eq!(json["command_id"]["sequence_number"], cmd.identity.sequence_number);

    let back: cmdflow_history::HistoryAttribute = serde_json::from_value(json).unwrap();
    assert_eq!(&back, status);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sequence_number_gets_its_own_identity() {
    let h = Harness::new();
    let mut w = h.watch();
    let issue = || {
        h.service
            .issue_command(
                "ONE_INT_ARG_TC",
                arguments(&[]),
                "integration",
                7,
                CommandOptions::default(),
            )
            .unwrap()
    };
    let first = issue();
    let second = issue();
    assert_ne!(first.identity, second.identity);
    assert_eq!(first.identity.sequence_number, second.identity.sequence_number);

    w.until_complete(&first.identity).await;
    w.until_complete(&second.identity).await;
    for cmd in [&first, &second] {
        let recorded = h.service.query_history(&cmd.identity).unwrap();
        assert_eq!(completion_count(&recorded), 1, "{}", cmd.identity);
        assert_eq!(
            recorded.iter().filter(|a| a.name == "Queue").count(),
            1,
            "{}",
            cmd.identity
        );
    }

    // a third issue after both completed still clashes with the history
    let third = issue();
    assert_ne!(third.identity, first.identity);
    assert_ne!(third.identity, second.identity);
    let attrs = w.until_complete(&third.identity).await;
    assert_eq!(completion_count(&attrs), 1);
}
