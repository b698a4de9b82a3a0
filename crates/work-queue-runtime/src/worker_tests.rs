//! Tests for the worker loop and handlers.

use super::*;
use crate::client::{Connection, DeliveryStream, MockChannel};
use crate::message::{ConsumerTag, DeliveryMode, DeliveryTag, QueueName, Task, Timestamp};
use crate::providers::{InMemoryBroker, InMemoryConnection};
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::task::JoinHandle;

const DEADLINE: Duration = Duration::from_secs(5);

fn walter() -> QueueDescriptor {
    QueueDescriptor::durable(QueueName::new("walter".to_string()).unwrap())
}

fn delivery(body: &'static str) -> Delivery {
    Delivery {
        tag: DeliveryTag::new(1),
        queue: walter().name,
        message_id: None,
        body: Bytes::from_static(body.as_bytes()),
        delivery_mode: DeliveryMode::Persistent,
        content_type: Some("text/plain".to_string()),
        redelivered: false,
        delivered_at: Timestamp::now(),
    }
}

async fn channel_on(broker: &InMemoryBroker) -> (InMemoryConnection, Arc<dyn Channel>) {
    let connection = broker.connect();
    let channel = Arc::from(connection.open_channel().await.unwrap());
    (connection, channel)
}

async fn publish(broker: &InMemoryBroker, bodies: &[&str]) {
    let (_connection, channel) = channel_on(broker).await;
    channel.declare_queue(&walter()).await.unwrap();
    for body in bodies {
        channel
            .publish(&walter().name, &Task::persistent(body.to_string()), DEADLINE)
            .await
            .unwrap();
    }
}

/// Poll until `condition` holds, failing after a few seconds
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should become true");
}

fn spawn_worker(
    worker: Worker,
    shutdown: &Shutdown,
) -> JoinHandle<Result<WorkerStats, QueueError>> {
    let shutdown = shutdown.clone();
    tokio::spawn(async move { worker.run(shutdown).await })
}

fn queue_drained(broker: &InMemoryBroker) -> bool {
    broker
        .queue_stats(&walter().name)
        .map(|s| s.ready == 0 && s.unacked == 0)
        .unwrap_or(false)
}

mod handlers {
    use super::*;

    #[test]
    fn test_marker_cost() {
        let handler = MarkerCostHandler::new(b'.', Duration::from_millis(100));

        assert_eq!(handler.cost(&delivery("Hello World!")), Duration::ZERO);
        assert_eq!(handler.cost(&delivery("task...")), Duration::from_millis(300));
        assert_eq!(
            MarkerCostHandler::default().cost(&delivery("a.b.")),
            Duration::from_secs(2)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_cost_handler_sleeps_per_marker() {
        let handler = MarkerCostHandler::default();
        let started = tokio::time::Instant::now();

        handler.handle(&delivery("task...")).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_handler_fn_receives_delivery() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = handler_fn(move |d: Delivery| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(d.body_text());
                Ok(())
            }
        });

        handler.handle(&delivery("hello")).await.unwrap();
        LoggingHandler.handle(&delivery("ignored")).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }
}

mod processing {
    use super::*;

    #[tokio::test]
    async fn test_hello_world_is_processed_and_acked() {
        let broker = InMemoryBroker::default();
        publish(&broker, &["Hello World!"]).await;

        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let worker = Worker::new(channel, walter(), Arc::new(MarkerCostHandler::default()));
        let handle = spawn_worker(worker, &shutdown);

        wait_until(|| queue_drained(&broker)).await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(
            stats,
            WorkerStats {
                received: 1,
                acked: 1,
                requeued: 0,
                rejected: 0
            }
        );
    }

    #[tokio::test]
    async fn test_retryable_failure_is_redelivered() {
        let broker = InMemoryBroker::default();
        publish(&broker, &["flaky"]).await;

        let attempts = Arc::new(AtomicUsize::new(0));
        let redelivered = Arc::new(Mutex::new(Vec::new()));
        let handler = {
            let attempts = attempts.clone();
            let redelivered = redelivered.clone();
            handler_fn(move |d: Delivery| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                redelivered.lock().unwrap().push(d.redelivered);
                async move {
                    if attempt == 0 {
                        Err(HandlerError::Retryable {
                            message: "not yet".to_string(),
                        })
                    } else {
                        Ok(())
                    }
                }
            })
        };

        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let handle = spawn_worker(Worker::new(channel, walter(), Arc::new(handler)), &shutdown);

        wait_until(|| attempts.load(Ordering::SeqCst) == 2 && queue_drained(&broker)).await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(*redelivered.lock().unwrap(), vec![false, true]);
    }

    #[tokio::test]
    async fn test_rejected_task_is_discarded() {
        let broker = InMemoryBroker::default();
        publish(&broker, &["poison", "fine"]).await;

        let handler = handler_fn(|d: Delivery| async move {
            if d.body_text() == "poison" {
                Err(HandlerError::Rejected {
                    message: "cannot parse".to_string(),
                })
            } else {
                Ok(())
            }
        });

        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let handle = spawn_worker(Worker::new(channel, walter(), Arc::new(handler)), &shutdown);

        wait_until(|| queue_drained(&broker)).await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.requeued, 0);
    }

    #[tokio::test]
    async fn test_auto_ack_session_never_settles() {
        let broker = InMemoryBroker::default();
        publish(&broker, &["one", "two"]).await;

        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let worker = Worker::new(channel, walter(), Arc::new(LoggingHandler))
            .with_session(ConsumerSession::auto_ack())
            .with_name("receiver");
        assert_eq!(worker.name(), "receiver");
        let handle = spawn_worker(worker, &shutdown);

        wait_until(|| queue_drained(&broker)).await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.acked, 2);
    }
}

mod stopping {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_mid_task_leaves_it_unacked() {
        let broker = InMemoryBroker::default();
        publish(&broker, &["slow......"]).await;

        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let handler = MarkerCostHandler::new(b'.', Duration::from_secs(3600));
        let handle = spawn_worker(
            Worker::new(channel.clone(), walter(), Arc::new(handler)),
            &shutdown,
        );

        wait_until(|| {
            broker
                .queue_stats(&walter().name)
                .map(|s| s.unacked == 1)
                .unwrap_or(false)
        })
        .await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.acked, 0);

        channel.close().await.unwrap();
        let queue_stats = broker.queue_stats(&walter().name).unwrap();
        assert_eq!(queue_stats.ready, 1);
        assert_eq!(queue_stats.unacked, 0);
    }

    #[tokio::test]
    async fn test_connection_loss_is_an_error() {
        let broker = InMemoryBroker::default();
        let (_connection, channel) = channel_on(&broker).await;
        let shutdown = Shutdown::new();
        let handle = spawn_worker(
            Worker::new(channel, walter(), Arc::new(LoggingHandler)),
            &shutdown,
        );

        wait_until(|| {
            broker
                .queue_stats(&walter().name)
                .map(|s| s.consumers == 1)
                .unwrap_or(false)
        })
        .await;
        broker.disconnect_all();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(QueueError::ConnectionLost { .. })));
    }

    #[tokio::test]
    async fn test_declare_mismatch_is_fatal() {
        let broker = InMemoryBroker::default();
        let (_owner, owner_channel) = channel_on(&broker).await;
        owner_channel
            .declare_queue(&QueueDescriptor::transient(walter().name))
            .await
            .unwrap();

        let (_connection, channel) = channel_on(&broker).await;
        let worker = Worker::new(channel, walter(), Arc::new(LoggingHandler));
        let result = worker.run(Shutdown::new()).await;

        assert!(matches!(result, Err(QueueError::DeclareMismatch { .. })));
    }

    #[tokio::test]
    async fn test_fatal_ack_failure_stops_worker() {
        let (sender, stream) = DeliveryStream::channel(ConsumerTag::new("ctag-test"), 1);
        sender.send(Ok(delivery("task"))).await.unwrap();

        let mut channel = MockChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel
            .expect_consume()
            .times(1)
            .return_once(move |_, _| Ok(stream));
        channel.expect_ack().times(1).returning(|_| {
            Err(QueueError::ChannelClosed {
                message: "closed by broker".to_string(),
            })
        });

        let worker = Worker::new(Arc::new(channel), walter(), Arc::new(LoggingHandler));
        let result = worker.run(Shutdown::new()).await;

        assert!(matches!(result, Err(QueueError::ChannelClosed { .. })));
        drop(sender);
    }

    #[tokio::test]
    async fn test_unknown_tag_on_ack_is_tolerated() {
        let (sender, stream) = DeliveryStream::channel(ConsumerTag::new("ctag-test"), 1);
        sender.send(Ok(delivery("task"))).await.unwrap();

        let mut channel = MockChannel::new();
        channel.expect_declare_queue().returning(|_| Ok(()));
        channel
            .expect_consume()
            .return_once(move |_, _| Ok(stream));
        channel
            .expect_ack()
            .returning(|tag| Err(QueueError::UnknownDeliveryTag { tag }));

        let shutdown = Shutdown::new();
        let worker = Worker::new(Arc::new(channel), walter(), Arc::new(LoggingHandler));
        let handle = spawn_worker(worker, &shutdown);

        // Stream stays open, so the worker keeps waiting until told to stop
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.trigger();

        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.acked, 0);
        drop(sender);
    }
}
