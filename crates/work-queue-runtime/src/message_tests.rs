//! Tests for message types.

use super::*;

#[test]
fn test_queue_name_validation() {
    // Valid names
    assert!(QueueName::new("walter".to_string()).is_ok());
    assert!(QueueName::new("task_queue".to_string()).is_ok());
    assert!(QueueName::new("orders.v2:high".to_string()).is_ok());

    // Invalid names
    assert!(QueueName::new("".to_string()).is_err());
    assert!(QueueName::new("a".repeat(256)).is_err());
    assert!(QueueName::new("special@chars".to_string()).is_err());
    assert!(QueueName::new("amq.gen-123".to_string()).is_err());
}

#[test]
fn test_queue_name_deserialization_validates() {
    let name: QueueName = serde_json::from_str("\"walter\"").unwrap();
    assert_eq!(name.as_str(), "walter");

    let invalid: Result<QueueName, _> = serde_json::from_str("\"bad name\"");
    assert!(invalid.is_err());
}

#[test]
fn test_message_id_generation() {
    let id1 = MessageId::new();
    let id2 = MessageId::new();
    assert_ne!(id1, id2);
    assert!(!id1.as_str().is_empty());
}

#[test]
fn test_descriptor_matching() {
    let name = QueueName::new("walter".to_string()).unwrap();
    let durable = QueueDescriptor::durable(name.clone());

    assert!(durable.matches(&QueueDescriptor::durable(name.clone())));
    assert!(!durable.matches(&QueueDescriptor::transient(name.clone())));
    assert!(!durable.matches(&QueueDescriptor::durable(name).with_exclusive(true)));
}

#[test]
fn test_delivery_mode_amqp_mapping() {
    assert_eq!(DeliveryMode::Persistent.as_amqp(), 2);
    assert_eq!(DeliveryMode::Transient.as_amqp(), 1);
    assert_eq!(DeliveryMode::from_amqp(Some(2)), DeliveryMode::Persistent);
    assert_eq!(DeliveryMode::from_amqp(None), DeliveryMode::Transient);
    assert_eq!(DeliveryMode::from_durable(true), DeliveryMode::Persistent);
}

#[test]
fn test_persistent_task_defaults() {
    let task = Task::persistent("Hello World!");

    assert_eq!(task.body, Bytes::from("Hello World!"));
    assert!(task.delivery_mode.is_persistent());
    assert_eq!(task.content_type, DEFAULT_CONTENT_TYPE);
}

#[test]
fn test_delivery_marker_count() {
    let delivery = Delivery {
        tag: DeliveryTag::new(1),
        queue: QueueName::new("walter".to_string()).unwrap(),
        message_id: None,
        body: Bytes::from("task..."),
        delivery_mode: DeliveryMode::Persistent,
        content_type: None,
        redelivered: false,
        delivered_at: Timestamp::now(),
    };

    assert_eq!(delivery.count_markers(b'.'), 3);
    assert_eq!(delivery.count_markers(b'#'), 0);
    assert_eq!(delivery.body_text(), "task...");
}

#[test]
fn test_consumer_session_presets() {
    let fair = ConsumerSession::fair_dispatch();
    assert_eq!(fair.prefetch_count, 1);
    assert!(!fair.auto_ack);
    assert_eq!(fair.buffer_capacity(), 1);

    let auto = ConsumerSession::auto_ack();
    assert_eq!(auto.prefetch_count, 0);
    assert!(auto.auto_ack);
    assert_eq!(auto.buffer_capacity(), 64);

    assert_eq!(ConsumerSession::default(), fair);
}
