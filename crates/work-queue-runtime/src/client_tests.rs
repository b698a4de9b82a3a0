//! Tests for the broker boundary helpers.

use super::*;
use crate::message::{DeliveryMode, Timestamp};
use crate::providers::InMemoryBroker;
use bytes::Bytes;

fn sample_delivery(tag: u64) -> Delivery {
    Delivery {
        tag: DeliveryTag::new(tag),
        queue: QueueName::new("walter".to_string()).unwrap(),
        message_id: None,
        body: Bytes::from_static(b"Hello World!"),
        delivery_mode: DeliveryMode::Persistent,
        content_type: None,
        redelivered: false,
        delivered_at: Timestamp::now(),
    }
}

mod delivery_stream {
    use super::*;

    #[tokio::test]
    async fn test_stream_yields_in_order_then_ends() {
        let (sender, mut stream) = DeliveryStream::channel(ConsumerTag::new("ctag-1"), 4);

        sender.send(Ok(sample_delivery(1))).await.unwrap();
        sender.send(Ok(sample_delivery(2))).await.unwrap();
        drop(sender);

        assert_eq!(stream.next().await.unwrap().unwrap().tag.value(), 1);
        assert_eq!(stream.next().await.unwrap().unwrap().tag.value(), 2);
        assert!(stream.next().await.is_none());
        // Not restartable
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_carries_errors() {
        let (sender, mut stream) = DeliveryStream::channel(ConsumerTag::new("ctag-1"), 1);

        sender
            .send(Err(QueueError::ConnectionLost {
                message: "gone".to_string(),
            }))
            .await
            .unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(QueueError::ConnectionLost { .. }))
        ));
        assert_eq!(stream.consumer_tag().as_str(), "ctag-1");
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        // mpsc panics on a zero capacity
        let (sender, _stream) = DeliveryStream::channel(ConsumerTag::generate(), 0);
        assert_eq!(sender.max_capacity(), 1);
    }
}

mod deadline {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_operation_finishing_in_time() {
        let result = with_deadline(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, QueueError>(42)
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_exceeding_deadline() {
        let result = with_deadline(Duration::from_secs(5), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, QueueError>(())
        })
        .await;

        match result {
            Err(QueueError::Timeout { duration }) => assert_eq!(duration, Duration::from_secs(5)),
            other => panic!("expected Timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inner_error_is_passed_through() {
        let result: Result<(), QueueError> = with_deadline(Duration::from_secs(5), async {
            Err(QueueError::QueueNotFound {
                queue_name: "nowhere".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(QueueError::QueueNotFound { .. })));
    }
}

mod factory {
    use super::*;
    use crate::config::ConnectionConfig;

    #[tokio::test]
    async fn test_connect_in_memory() {
        let broker = InMemoryBroker::default();
        let connection = ConnectionFactory::connect(&ProviderConfig::InMemory(broker.clone()))
            .await
            .unwrap();

        assert!(connection.is_connected());
        assert_eq!(connection.provider_type(), ProviderType::InMemory);
        assert_eq!(broker.connection_count(), 1);

        connection.close().await.unwrap();
        assert!(!connection.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_amqp_config_rejected_before_dialling() {
        let config = ConnectionConfig {
            host: String::new(),
            ..Default::default()
        };

        let result = ConnectionFactory::connect(&ProviderConfig::Amqp(config)).await;
        assert!(matches!(result, Err(QueueError::Configuration(_))));
    }
}
