// tests/integration/dispatcher_test.rs

//! Integration tests for the dispatcher: hand-off order, lifecycle,
//! failure recovery and teardown.

use super::test_helpers::{DESTINATION, HandlerScript, RECV_TIMEOUT, TestContext, wait_until};
use seqdispatch::broker::Message;
use seqdispatch::config::DispatcherSettings;
use seqdispatch::core::errors::{BrokerError, SequencerError};
use seqdispatch::core::keys::MessageKey;
use seqdispatch::core::lifecycle::{LifecycleAction, LifecycleState};
use seqdispatch::core::pool::LeaseState;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

// ===== Hand-off order =====

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_are_handed_off_in_delivery_order() {
    let mut ctx = TestContext::new().await;
    let expected: Vec<String> = (0..25).map(|i| format!("m{i}")).collect();
    for (i, body) in expected.iter().enumerate() {
        ctx.publish(body, &format!("k{}", i % 3));
    }

    ctx.dispatcher.start().await.unwrap();
    let bodies = ctx.next_bodies(expected.len()).await;
    assert_eq!(bodies, expected);

    let report = ctx.dispatcher.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(ctx.broker.queue_depth(DESTINATION), 0);
}

#[tokio::test]
async fn test_messages_published_while_running_are_delivered() {
    let mut ctx = TestContext::new().await;
    ctx.dispatcher.start().await.unwrap();
    assert_eq!(ctx.dispatcher.state(), LifecycleState::Running);

    ctx.publish("late", "k");
    let delivered = ctx.next_delivery().await;
    assert_eq!(delivered.body, "late");
    assert_eq!(delivered.key, "k");
    assert!(!delivered.redelivered);

    ctx.dispatcher.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_handler_holds_back_later_messages() {
    let mut ctx = TestContext::with_script(HandlerScript {
        block_on: Some("A".to_string()),
        ..Default::default()
    })
    .await;
    for body in ["A", "B", "C"] {
        ctx.publish(body, "k");
    }
    ctx.dispatcher.start().await.unwrap();

    let first = ctx.next_delivery().await;
    assert_eq!(first.body, "A");
    ctx.assert_no_delivery(Duration::from_millis(200)).await;

    // A's session is still leased; another session can be acquired anyway.
    let extra = tokio::time::timeout(Duration::from_secs(1), ctx.dispatcher.pool().acquire())
        .await
        .expect("acquire deadlocked behind the blocked handler")
        .unwrap();
    assert_ne!(extra.id(), first.session_id);
    assert_eq!(
        ctx.dispatcher.pool().state_of(first.session_id),
        Some(LeaseState::Leased)
    );
    extra.release().unwrap();

    ctx.handler.unblock();
    assert_eq!(ctx.next_bodies(2).await, vec!["B", "C"]);

    ctx.dispatcher.shutdown().await.unwrap();
}

// ===== Lifecycle =====

#[tokio::test]
async fn test_stop_then_start_resumes_on_the_same_connection() {
    let mut ctx = TestContext::new().await;
    ctx.dispatcher.start().await.unwrap();
    ctx.publish("before", "k");
    assert_eq!(ctx.next_delivery().await.body, "before");

    let report = ctx.dispatcher.stop().await.unwrap();
    assert!(report.intake_terminated);
    assert!(report.is_clean());
    assert_eq!(ctx.dispatcher.state(), LifecycleState::Stopped);

    ctx.publish("while-stopped", "k");
    ctx.assert_no_delivery(Duration::from_millis(200)).await;
    assert_eq!(ctx.broker.queue_depth(DESTINATION), 1);

    ctx.dispatcher.start().await.unwrap();
    assert_eq!(ctx.next_delivery().await.body, "while-stopped");
    assert_eq!(ctx.broker.connections_created(), 1);

    ctx.dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_transitions_are_rejected() {
    let ctx = TestContext::new().await;

    let err = ctx.dispatcher.stop().await.unwrap_err();
    assert_eq!(
        err,
        SequencerError::InvalidTransition {
            state: LifecycleState::Created,
            action: LifecycleAction::Stop,
        }
    );

    ctx.dispatcher.start().await.unwrap();
    let err = ctx.dispatcher.start().await.unwrap_err();
    assert_eq!(err.to_string(), "cannot start while running");

    ctx.dispatcher.shutdown().await.unwrap();
    assert_eq!(ctx.dispatcher.state(), LifecycleState::ShutDown);

    for action in [LifecycleAction::Start, LifecycleAction::Stop, LifecycleAction::Shutdown] {
        let result = match action {
            LifecycleAction::Start => ctx.dispatcher.start().await,
            LifecycleAction::Stop => ctx.dispatcher.stop().await.map(|_| ()),
            LifecycleAction::Shutdown => ctx.dispatcher.shutdown().await.map(|_| ()),
        };
        assert_eq!(
            result.unwrap_err(),
            SequencerError::InvalidTransition {
                state: LifecycleState::ShutDown,
                action,
            }
        );
    }
}

#[tokio::test]
async fn test_shutdown_from_created_closes_the_connection() {
    let ctx = TestContext::new().await;
    let report = ctx.dispatcher.shutdown().await.unwrap();
    assert!(report.stop.is_none());
    assert_eq!(report.drain.closed, 0);
    assert!(report.is_clean());
    assert_eq!(ctx.handler.shutdowns(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_while_parked_in_receive_returns_within_grace() {
    let mut settings = DispatcherSettings::new(DESTINATION);
    settings.stop_grace_period = Duration::from_millis(500);
    let ctx = TestContext::with_settings(HandlerScript::default(), settings).await;
    ctx.dispatcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    let report = ctx.dispatcher.shutdown().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    let stop = report.stop.expect("dispatcher was running");
    assert!(stop.intake_terminated);
    assert!(stop.workers_terminated);
    assert_eq!(ctx.handler.shutdowns(), 1);
    assert!(ctx.dispatcher.pool().is_empty());
}

// ===== Teardown =====

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_every_session_exactly_once_despite_failures() {
    let ctx = TestContext::new().await;
    ctx.dispatcher.start().await.unwrap();
    wait_until("the intake loop holds a session", || {
        ctx.broker.sessions_created() == 1
    })
    .await;

    let pool = ctx.dispatcher.pool().clone();
    let a = pool.acquire().await.unwrap();
    let b = pool.acquire().await.unwrap();
    let held = pool.acquire().await.unwrap();
    a.release().unwrap();
    b.release().unwrap();
    // Intake loop's session plus the three above.
    assert_eq!(ctx.broker.sessions_created(), 4);

    ctx.broker.inject_close_failures(2);
    let report = ctx.dispatcher.shutdown().await.unwrap();

    assert_eq!(report.drain.closed, 4);
    assert_eq!(report.drain.failures.len(), 2);
    assert_eq!(report.failure_count(), 2);
    assert!(!report.is_clean());
    assert!(pool.is_empty());
    for probe in ctx.broker.session_probes() {
        assert_eq!(probe.close_calls(), 1, "session {}", probe.id());
    }

    // A lease that outlived the drain cannot close its session again.
    assert!(held.commit_and_release().await.is_err());
    for probe in ctx.broker.session_probes() {
        assert_eq!(probe.close_calls(), 1, "session {}", probe.id());
    }
}

// ===== Failure recovery =====

#[tokio::test]
async fn test_failing_receive_abandons_the_session() {
    let mut ctx = TestContext::new().await;
    ctx.broker
        .inject_receive_failure(BrokerError::Receive("link reset".to_string()));
    ctx.dispatcher.start().await.unwrap();

    ctx.publish("after-failure", "k");
    let delivered = ctx.next_delivery().await;
    assert_eq!(delivered.body, "after-failure");

    let probes = ctx.broker.session_probes();
    assert_eq!(probes[0].close_calls(), 1);
    assert_ne!(delivered.session_id, probes[0].id());
    assert_eq!(
        ctx.dispatcher.pool().state_of(probes[0].id()),
        Some(LeaseState::Abandoned)
    );
    let stats = ctx.dispatcher.pool_stats();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.created, 2);

    let report = ctx.dispatcher.shutdown().await.unwrap();
    assert_eq!(report.drain.closed, 1);
    for probe in ctx.broker.session_probes() {
        assert_eq!(probe.close_calls(), 1, "session {}", probe.id());
    }
}

#[tokio::test]
async fn test_key_extraction_failure_rolls_back_and_redelivers() {
    let failed_once = Arc::new(AtomicBool::new(false));
    let flag = failed_once.clone();
    let extractor = move |message: &Message| {
        if &message.body[..] == b"poison" && !flag.swap(true, Ordering::SeqCst) {
            return Err(SequencerError::KeyExtraction("unreadable".to_string()));
        }
        Ok(MessageKey::new(message.property("key").unwrap_or("none")))
    };
    let mut ctx = TestContext::build(
        HandlerScript::default(),
        DispatcherSettings::new(DESTINATION),
        Arc::new(extractor),
    )
    .await;
    ctx.publish("poison", "k");
    ctx.publish("next", "k");
    ctx.dispatcher.start().await.unwrap();

    let first = ctx.next_delivery().await;
    assert_eq!(first.body, "poison");
    assert!(first.redelivered);
    assert_eq!(ctx.next_delivery().await.body, "next");
    assert!(failed_once.load(Ordering::SeqCst));
    assert_eq!(ctx.dispatcher.pool_stats().abandoned, 1);

    ctx.dispatcher.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_handler_error_shuts_the_dispatcher_down() {
    let mut ctx = TestContext::with_script(HandlerScript {
        fail_on: Some("bad".to_string()),
        ..Default::default()
    })
    .await;
    ctx.publish("bad", "k");
    ctx.dispatcher.start().await.unwrap();
    assert_eq!(ctx.next_delivery().await.body, "bad");

    tokio::time::timeout(
        RECV_TIMEOUT,
        ctx.dispatcher.wait_for_state(LifecycleState::ShutDown),
    )
    .await
    .expect("dispatcher did not shut itself down");

    assert!(matches!(
        ctx.dispatcher.failure(),
        Some(SequencerError::Handler(_))
    ));
    assert_eq!(ctx.handler.shutdowns(), 1);
    assert!(ctx.dispatcher.pool().is_empty());
    // The rolled-back message is back on the queue.
    assert_eq!(ctx.broker.queue_depth(DESTINATION), 1);
}

#[tokio::test]
async fn test_handler_panic_shuts_the_dispatcher_down() {
    let mut ctx = TestContext::with_script(HandlerScript {
        panic_on: Some("explode".to_string()),
        ..Default::default()
    })
    .await;
    ctx.publish("explode", "k");
    ctx.dispatcher.start().await.unwrap();
    assert_eq!(ctx.next_delivery().await.body, "explode");

    tokio::time::timeout(
        RECV_TIMEOUT,
        ctx.dispatcher.wait_for_state(LifecycleState::ShutDown),
    )
    .await
    .expect("dispatcher did not shut itself down");

    match ctx.dispatcher.failure() {
        Some(SequencerError::HandlerPanicked(msg)) => assert!(msg.contains("explode")),
        other => panic!("unexpected failure: {other:?}"),
    }
    for probe in ctx.broker.session_probes() {
        assert_eq!(probe.close_calls(), 1, "session {}", probe.id());
    }
}

#[tokio::test]
async fn test_session_creation_failure_is_fatal() {
    let ctx = TestContext::new().await;
    ctx.broker
        .inject_session_creation_failure(BrokerError::Transport("refused".to_string()));
    ctx.dispatcher.start().await.unwrap();

    tokio::time::timeout(
        RECV_TIMEOUT,
        ctx.dispatcher.wait_for_state(LifecycleState::ShutDown),
    )
    .await
    .expect("dispatcher did not shut itself down");

    assert_eq!(
        ctx.dispatcher.failure(),
        Some(SequencerError::Broker(BrokerError::Transport(
            "refused".to_string()
        )))
    );
    assert_eq!(ctx.broker.sessions_created(), 0);
}
