//! Queue control scenarios

use crate::test_utils::*;
use cmdflow_commanding::{AdmissionError, CommandOptions, CommandingError, QueueError};
use cmdflow_core::{BlockedPolicy, QueueConfig, QueueState, Value};
use tokio::time::Duration;

fn blocked() -> Harness {
    Harness::with_queues(&[QueueConfig::new("default", QueueState::Blocked)])
}

#[tokio::test(start_paused = true)]
async fn test_enabling_releases_held_commands_in_order() {
    let mut h = blocked();
    let mut w = h.watch();
    let cmds: Vec<_> = (0..3)
        .map(|i| {
            h.issue(
                "ONE_INT_ARG_TC",
                &[("uint32_arg", Value::Int(i))],
                CommandOptions::default(),
            )
        })
        .collect();

    tokio::task::yield_now().await;
    assert!(h.sent.try_recv().is_err());
    let pending: Vec<_> = cmds.iter().map(|c| c.identity.clone()).collect();
    assert_eq!(h.service.queue("default").unwrap().pending, pending);

    let info = h
        .service
        .set_queue_state("default", QueueState::Enabled)
        .await
        .unwrap();
    assert_eq!(info.state, QueueState::Enabled);

    for cmd in &cmds {
        assert_eq!(h.sent.recv().await.unwrap().identity, cmd.identity);
    }
    for cmd in &cmds {
        let attrs = w.until_complete(&cmd.identity).await;
        assert_eq!(
            statuses(&attrs),
            stages(&[
                ("AcknowledgeQueued", "OK"),
                ("TransmissionConstraints", "NA"),
                ("AcknowledgeReleased", "OK"),
                ("CommandComplete", "OK"),
            ])
        );
    }
    assert!(h.service.queue("default").unwrap().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_operator_release_of_held_command() {
    let mut h = blocked();
    let mut w = h.watch();
    let first = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());
    let second = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());

    h.service
        .release_command(&second.identity, false)
        .await
        .unwrap();
    let sent = h.sent.recv().await.unwrap();
    assert_eq!(sent.identity, second.identity);
    assert_eq!(sent.prepared_at_ms, second.prepared_at_ms);
    let attrs = w.until_complete(&second.identity).await;
    assert!(attrs.iter().all(|a| a.name != "Rebuilt"));

    // the other command stays held
    assert_eq!(
        h.service.queue("default").unwrap().pending,
        vec![first.identity.clone()]
    );
    assert!(h.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_release_with_rebuild() {
    let mut h = blocked();
    let mut w = h.watch();
    let cmd = h.issue(
        "ONE_INT_ARG_TC",
        &[("uint32_arg", Value::Int(9))],
        CommandOptions::default(),
    );

    // the preparation time is wall-clock, so let it move
    std::thread::sleep(std::time::Duration::from_millis(5));
    h.service.release_command(&cmd.identity, true).await.unwrap();
    let sent = h.sent.recv().await.unwrap();
    assert_eq!(sent.identity, cmd.identity);
    assert_eq!(sent.arguments, cmd.arguments);
    assert!(sent.prepared_at_ms > cmd.prepared_at_ms);

    let attrs = w.until_complete(&cmd.identity).await;
    let rebuilt: Vec<_> = attrs.iter().filter(|a| a.name == "Rebuilt").collect();
    assert_eq!(rebuilt.len(), 1);
    assert_eq!(rebuilt[0].value, Value::Timestamp(sent.prepared_at_ms));
    // recorded before the release acknowledgement
    let position = |name: &str| attrs.iter().position(|a| a.name == name).unwrap();
    assert!(position("Rebuilt") < position("AcknowledgeReleased_Status"));
    assert_eq!(
        statuses(&attrs).last(),
        Some(&("CommandComplete".to_string(), "OK".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_reject_held_command() {
    let mut h = blocked();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());

    h.service.reject_command(&cmd.identity, "alice").unwrap();

    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs),
        stages(&[
            ("AcknowledgeQueued", "OK"),
            ("AcknowledgeReleased", "NOK"),
            ("CommandComplete", "NOK"),
        ])
    );
    assert_eq!(
        message(&attrs, "AcknowledgeReleased").as_deref(),
        Some("Rejected by alice")
    );
    assert_eq!(
        message(&attrs, "CommandComplete").as_deref(),
        Some("Rejected by alice")
    );
    assert!(h.sent.try_recv().is_err());
    assert!(h.service.queue("default").unwrap().pending.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_cancels_held_commands() {
    let mut h = blocked();
    let mut w = h.watch();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());

    h.service
        .set_queue_state("default", QueueState::Disabled)
        .await
        .unwrap();

    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs),
        stages(&[
            ("AcknowledgeQueued", "OK"),
            ("AcknowledgeReleased", "NOK"),
            ("CommandComplete", "NOK"),
        ])
    );
    assert_eq!(
        message(&attrs, "CommandComplete").as_deref(),
        Some("Queue disabled")
    );
    assert!(h.sent.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_disabling_cancels_constraint_wait() {
    let mut h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("CRITICAL_TC2", &[("p1", Value::Int(2))], CommandOptions::default());
    w.until(&cmd.identity, "TransmissionConstraints_Status", "PENDING")
        .await;

    h.service
        .set_queue_state("default", QueueState::Disabled)
        .await
        .unwrap();

    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs),
        stages(&[
            ("AcknowledgeQueued", "OK"),
            ("TransmissionConstraints", "PENDING"),
            ("TransmissionConstraints", "CANCELLED"),
            ("AcknowledgeReleased", "NOK"),
            ("CommandComplete", "NOK"),
        ])
    );
    assert!(h.sent.try_recv().is_err());
    assert_eq!(h.bus.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_release_of_command_not_held() {
    let h = Harness::new();
    let mut w = h.watch();
    let cmd = h.issue("CRITICAL_TC2", &[("p1", Value::Int(2))], CommandOptions::default());
    w.until(&cmd.identity, "TransmissionConstraints_Status", "PENDING")
        .await;

    let err = h
        .service
        .release_command(&cmd.identity, false)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Queue(QueueError::NotHeld { .. })
    ));

    // the constraint wait is unaffected
    h.bus.publish_parameter(ALLOW_TC2, Value::Bool(true));
    let attrs = w.until_complete(&cmd.identity).await;
    assert_eq!(
        statuses(&attrs).last(),
        Some(&("CommandComplete".to_string(), "OK".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_unknown_queue() {
    let h = Harness::new();
    let mut w = h.watch();

    let err = h
        .service
        .set_queue_state("nope", QueueState::Enabled)
        .await
        .unwrap_err();
    assert!(matches!(err, CommandingError::Queue(QueueError::UnknownQueue(_))));

    let options = CommandOptions {
        queue: Some("nope".to_string()),
        ..CommandOptions::default()
    };
    let err = h.try_issue("ONE_INT_ARG_TC", &[], options).unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Admission(AdmissionError::UnknownQueue(_))
    ));

    // the refusal is still recorded, without a queue
    let refused = w.drain();
    assert!(refused.iter().all(|a| a.name != "Queue"));
    assert_eq!(
        statuses(&refused),
        stages(&[("AcknowledgeQueued", "NOK"), ("CommandComplete", "NOK")])
    );
}

#[tokio::test(start_paused = true)]
async fn test_no_matching_queue() {
    let mut restricted = QueueConfig::new("ops", QueueState::Enabled);
    restricted.users = vec!["operator".to_string()];
    let h = Harness::with_queues(&[restricted]);

    let err = h
        .try_issue("ONE_INT_ARG_TC", &[], CommandOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Admission(AdmissionError::NoMatchingQueue)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_blocked_queue_rejecting_without_override() {
    let mut config = QueueConfig::new("default", QueueState::Blocked);
    config.blocked_policy = BlockedPolicy::Reject;
    let mut h = Harness::with_queues(&[config]);
    let mut w = h.watch();

    let err = h
        .try_issue("ONE_INT_ARG_TC", &[], CommandOptions::default())
        .unwrap_err();
    assert!(matches!(
        err,
        CommandingError::Admission(AdmissionError::Blocked { .. })
    ));
    let refused = w.drain();
    assert_eq!(refused[0].name, "Queue");
    assert_eq!(
        statuses(&refused),
        stages(&[("AcknowledgeQueued", "NOK"), ("CommandComplete", "NOK")])
    );
    assert_eq!(
        message(&refused, "AcknowledgeQueued").as_deref(),
        Some("Queue blocked")
    );

    let options = CommandOptions {
        override_block: true,
        ..CommandOptions::default()
    };
    let cmd = h.issue("ONE_INT_ARG_TC", &[], options);
    assert_eq!(
        h.service.queue("default").unwrap().pending,
        vec![cmd.identity.clone()]
    );
    h.service.release_command(&cmd.identity, false).await.unwrap();
    assert_eq!(h.sent.recv().await.unwrap().identity, cmd.identity);
}

#[tokio::test(start_paused = true)]
async fn test_state_expires_to_default() {
    let mut config = QueueConfig::new("default", QueueState::Enabled);
    config.state_expiration_secs = Some(30);
    let mut h = Harness::with_queues(&[config]);

    h.service
        .set_queue_state("default", QueueState::Blocked)
        .await
        .unwrap();
    let cmd = h.issue("ONE_INT_ARG_TC", &[], CommandOptions::default());

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(h.service.queue("default").unwrap().state, QueueState::Blocked);
    assert!(h.sent.try_recv().is_err());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.service.queue("default").unwrap().state, QueueState::Enabled);
    assert_eq!(h.sent.recv().await.unwrap().identity, cmd.identity);
}

#[tokio::test(start_paused = true)]
async fn test_new_state_change_restarts_expiration() {
    let mut config = QueueConfig::new("default", QueueState::Enabled);
    config.state_expiration_secs = Some(30);
    let h = Harness::with_queues(&[config]);

    h.service
        .set_queue_state("default", QueueState::Blocked)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    h.service
        .set_queue_state("default", QueueState::Disabled)
        .await
        .unwrap();

    // the first expiration is stale
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.service.queue("default").unwrap().state, QueueState::Disabled);

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(h.service.queue("default").unwrap().state, QueueState::Enabled);
}
