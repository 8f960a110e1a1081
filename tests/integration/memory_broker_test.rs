// tests/integration/memory_broker_test.rs

//! Tests for the in-memory broker's transactional behaviour.

use seqdispatch::broker::memory::MemoryBroker;
use seqdispatch::broker::{BrokerConnection, ConnectionFactory, Message};
use seqdispatch::core::errors::BrokerError;
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "q";

async fn started_connection(broker: &MemoryBroker) -> Arc<dyn BrokerConnection> {
    let connection = broker.create_connection().await.unwrap();
    connection.start().await.unwrap();
    connection
}

fn body(message: &Message) -> &[u8] {
    &message.body
}

#[tokio::test]
async fn test_rollback_requeues_at_the_front_in_order() {
    let broker = MemoryBroker::new();
    for b in ["1", "2", "3"] {
        broker.send(QUEUE, Message::new("", b));
    }
    let connection = started_connection(&broker).await;
    let session = connection.create_session().await.unwrap();
    let mut consumer = session.create_consumer(QUEUE).await.unwrap();

    let first = consumer.receive().await.unwrap().unwrap();
    let second = consumer.receive().await.unwrap().unwrap();
    assert!(!first.message_id.is_empty());
    assert_eq!((body(&first), body(&second)), (&b"1"[..], &b"2"[..]));
    session.rollback().await.unwrap();

    assert_eq!(broker.queue_depth(QUEUE), 3);
    let again = consumer.receive().await.unwrap().unwrap();
    assert_eq!(again.message_id, first.message_id);
    assert!(again.redelivered);

    session.commit().await.unwrap();
    assert_eq!(broker.queue_depth(QUEUE), 2);
}

#[tokio::test]
async fn test_receive_waits_while_the_connection_is_stopped() {
    let broker = MemoryBroker::new();
    let connection = started_connection(&broker).await;
    let session = connection.create_session().await.unwrap();
    let mut consumer = session.create_consumer(QUEUE).await.unwrap();
    connection.stop().await.unwrap();

    broker.send(QUEUE, Message::new("m-1", "x"));
    let parked = tokio::time::timeout(Duration::from_millis(100), consumer.receive()).await;
    assert!(parked.is_err(), "received while the connection was stopped");

    connection.start().await.unwrap();
    let message = consumer.receive().await.unwrap().unwrap();
    assert_eq!(message.message_id, "m-1");
}

#[tokio::test]
async fn test_sessions_require_a_started_open_connection() {
    let broker = MemoryBroker::new();
    let connection = broker.create_connection().await.unwrap();
    assert_eq!(
        connection.create_session().await.err(),
        Some(BrokerError::ConnectionNotStarted)
    );
    connection.close().await.unwrap();
    assert_eq!(connection.start().await, Err(BrokerError::ConnectionClosed));
}

#[tokio::test]
async fn test_failed_close_still_closes_and_rolls_back() {
    let broker = MemoryBroker::new();
    broker.send(QUEUE, Message::new("m-1", "x"));
    let connection = started_connection(&broker).await;
    let session = connection.create_session().await.unwrap();
    let mut consumer = session.create_consumer(QUEUE).await.unwrap();
    consumer.receive().await.unwrap().unwrap();

    broker.inject_close_failures(1);
    assert!(session.close().await.is_err());
    assert_eq!(broker.queue_depth(QUEUE), 1);
    assert_eq!(consumer.receive().await, Err(BrokerError::SessionClosed));
    assert_eq!(broker.session_probes()[0].close_calls(), 1);
}

#[tokio::test]
async fn test_closed_consumer_returns_none() {
    let broker = MemoryBroker::new();
    let connection = started_connection(&broker).await;
    let session = connection.create_session().await.unwrap();
    let mut consumer = session.create_consumer(QUEUE).await.unwrap();
    consumer.close().await.unwrap();
    assert_eq!(consumer.receive().await, Ok(None));
}
