//! End-to-end checks against a live Redis server.
//!
//! Run with `cargo test -- --ignored`; `REDIS_URL` defaults to
//! `redis://localhost:6379`. Every test works under its own key prefix.

use redis::AsyncCommands;
use serde_json::json;
use smithymq::consumer::{ConsumerInfo, heartbeat, subscription};
use smithymq::events;
use smithymq::prelude::*;
use smithymq::queue::purge::PurgeJobStatus;
use smithymq::queue::{QueueLockOwner, QueueOperationalState, StateTransitionOptions, StateTransitionReason};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

async fn connect(events: SharedEventBus, workers: bool) -> Smithy {
    let mut config = SmithyConfig::testing();
    config.redis.connection_string =
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    config.redis.key_prefix = format!("smithymq-it-{}", uuid::Uuid::new_v4().simple());
    config.workers.enabled = workers;
    Smithy::with_events(config, events).await.unwrap()
}

async fn queue(smithy: &Smithy, queue_type: QueueType, delivery_model: DeliveryModel) -> QueueParams {
    let queue = QueueParams::new("orders", "shop").unwrap();
    smithy
        .queues()
        .create_queue(&queue, queue_type, delivery_model)
        .await
        .unwrap();
    queue
}

fn message(queue: &QueueParams) -> ProducibleMessage {
    ProducibleMessage::new(json!({"order": 42})).set_queue(queue.clone())
}

fn counting_handler(seen: Arc<AtomicUsize>) -> impl MessageHandler {
    handler_fn(move |_message: MessageEnvelope| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok::<_, HandlerError>(())
        }
    })
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_pub_sub_groups_get_independent_copies() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PubSub).await;
    for group in ["billing", "shipping"] {
        assert!(smithy.queues().create_consumer_group(&queue, group).await.unwrap());
    }

    let ids = smithy.producer().produce(message(&queue)).await.unwrap();
    assert_eq!(ids.len(), 2);

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.pending, 2);
    assert!(counts.is_consistent());

    let storage = smithy.storage();
    let held = storage
        .checkout(&queue, Some("billing"), "consumer-1")
        .await
        .unwrap()
        .unwrap();
    assert_ok!(storage.acknowledge(&queue, "consumer-1", &held).await);

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.acknowledged, 1);
    assert_eq!(counts.total, 2);
    assert!(counts.is_consistent());

    let shipping = storage.checkout(&queue, Some("shipping"), "consumer-2").await.unwrap();
    assert!(shipping.is_some_and(|id| id != held));
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_checkout_on_empty_queue() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Lifo, DeliveryModel::PointToPoint).await;

    for _ in 0..3 {
        let id = smithy.storage().checkout(&queue, None, "consumer-1").await.unwrap();
        assert_eq!(id, None);
    }
    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts, Default::default());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_unacknowledge_delays_then_dead_letters() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let storage = smithy.storage();

    let msg = message(&queue).set_retry_threshold(2).set_retry_delay(5_000);
    let id = smithy.producer().produce(msg).await.unwrap().remove(0);

    let held = storage.checkout(&queue, None, "consumer-1").await.unwrap();
    assert_eq!(held.as_ref(), Some(&id));
    let first = storage
        .unacknowledge(&queue, "consumer-1", &id, UnacknowledgeReason::ConsumeError)
        .await
        .unwrap();
    assert_eq!(first.outcome, smithymq::message::UnacknowledgeOutcome::Delayed);
    assert_eq!(smithy.messages().get_message_status(&id).await.unwrap(), MessageStatus::UnackDelaying);

    // back to pending through the scheduled set
    assert!(storage.requeue_delayed(&queue, &id).await.unwrap());
    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.scheduled, 1);
    assert!(counts.is_consistent());
    let scheduled = smithy.messages().get_message_by_id(&id).await.unwrap();
    assert!(storage.publish_scheduled(&scheduled, None, None).await.unwrap());

    let held = storage.checkout(&queue, None, "consumer-1").await.unwrap();
    assert_eq!(held.as_ref(), Some(&id));
    let second = storage
        .unacknowledge(&queue, "consumer-1", &id, UnacknowledgeReason::ConsumeError)
        .await
        .unwrap();
    assert_eq!(second.outcome, smithymq::message::UnacknowledgeOutcome::DeadLettered);
    assert_eq!(second.attempts, 2);

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.dead_lettered, 1);
    assert!(counts.is_consistent());

    // a message no longer held is left alone
    let again = storage
        .unacknowledge(&queue, "consumer-1", &id, UnacknowledgeReason::ConsumeError)
        .await
        .unwrap();
    assert_eq!(again.outcome, smithymq::message::UnacknowledgeOutcome::NotInProcessing);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_requeue_acknowledged_message() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let storage = smithy.storage();

    let ids = smithy.producer().produce(message(&queue)).await.unwrap();
    let pending = smithy.producer().produce(message(&queue)).await.unwrap();
    let id = storage.checkout(&queue, None, "consumer-1").await.unwrap().unwrap();
    assert_eq!(id, ids[0]);
    storage.acknowledge(&queue, "consumer-1", &id).await.unwrap();

    let requeued = smithy.messages().requeue_message_by_id(&queue, &id).await.unwrap();
    assert_ne!(requeued, id);
    assert_eq!(smithy.messages().get_message_status(&id).await.unwrap(), MessageStatus::Acknowledged);
    assert_eq!(smithy.messages().get_message_status(&requeued).await.unwrap(), MessageStatus::Pending);

    let err = assert_err!(smithy.messages().requeue_message_by_id(&queue, &pending[0]).await);
    assert!(matches!(err, SmithyError::MessageNotRequeuable { .. }));
    assert!(smithy.queues().get_message_counts(&queue).await.unwrap().is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_delete_reports_missing_messages() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.extend(smithy.producer().produce(message(&queue)).await.unwrap());
    }
    smithy.messages().delete_message_by_id(&ids[2]).await.unwrap();

    let reply = smithy.messages().delete_messages_by_ids(&ids).await.unwrap();
    assert_eq!(reply.stats.success, 2);
    assert_eq!(reply.stats.not_found, 1);

    let reply = smithy.messages().delete_messages_by_ids(&ids).await.unwrap();
    assert_eq!(reply.stats.success, 0);
    assert_eq!(reply.stats.not_found, 3);

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.total, 0);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_lock_and_unlock() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let state = smithy.state();

    state
        .lock(&queue, QueueLockOwner::PurgeJob, "job-1", StateTransitionReason::Purge)
        .await
        .unwrap();
    assert!(state.is_locked(&queue).await.unwrap());
    assert_err!(
        state
            .lock(&queue, QueueLockOwner::PurgeJob, "job-2", StateTransitionReason::Purge)
            .await
    );

    let err = assert_err!(
        state
            .unlock(
                &queue,
                QueueLockOwner::PurgeJob,
                "job-2",
                StateTransitionReason::Completed,
                StateTransitionOptions::default(),
            )
            .await
    );
    assert!(matches!(err, SmithyError::InvalidLock { .. }));

    let before = state.get_history(&queue, 100).await.unwrap().len();
    let transition = state
        .unlock(
            &queue,
            QueueLockOwner::PurgeJob,
            "job-1",
            StateTransitionReason::Completed,
            StateTransitionOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(transition.to, QueueOperationalState::Active);
    assert_eq!(state.get_history(&queue, 100).await.unwrap().len(), before + 1);
    assert!(!state.is_locked(&queue).await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_rate_limit_window() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let limit = QueueRateLimit::new(3, 10_000).unwrap();
    smithy.queues().set_rate_limit(&queue, limit).await.unwrap();

    for _ in 0..3 {
        assert!(!smithy.queues().has_rate_limit_exceeded(&queue, &limit).await.unwrap());
    }
    assert!(smithy.queues().has_rate_limit_exceeded(&queue, &limit).await.unwrap());

    smithy.queues().clear_rate_limit(&queue).await.unwrap();
    assert_eq!(smithy.queues().get_rate_limit(&queue).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_offline_consumer_is_reaped_once() {
    let bus = Arc::new(BroadcastEventBus::new(1024));
    let mut rx = bus.subscribe();
    let smithy = connect(bus.clone(), true).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let id = smithy.producer().produce(message(&queue)).await.unwrap().remove(0);

    // a consumer that never sends a heartbeat
    let ghost = ConsumerInfo::current("ghost");
    subscription::subscribe(smithy.redis(), &ghost, &queue, None).await.unwrap();
    let held = smithy.storage().checkout(&queue, None, "ghost").await.unwrap();
    assert_eq!(held.as_ref(), Some(&id));

    smithy.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    smithy.shutdown().await.unwrap();

    let mut reaped = 0;
    while let Ok(event) = rx.try_recv() {
        if let SmithyEvent::MessageUnacknowledged {
            message_id, reason, ..
        } = event
        {
            if message_id == id && reason == UnacknowledgeReason::OfflineConsumer {
                reaped += 1;
            }
        }
    }
    assert_eq!(reaped, 1);
    assert!(!heartbeat::is_alive(smithy.redis(), "ghost").await.unwrap());
    assert_ne!(
        smithy.messages().get_message_status(&id).await.unwrap(),
        MessageStatus::Processing
    );
    assert!(smithy.queues().get_queue_consumer_ids(&queue).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_released_slots_do_not_count_against_the_window() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let limit = QueueRateLimit::new(3, 10_000).unwrap();
    smithy.queues().set_rate_limit(&queue, limit).await.unwrap();

    for _ in 0..10 {
        assert!(!smithy.queues().has_rate_limit_exceeded(&queue, &limit).await.unwrap());
        assert_ok!(smithy.queues().release_rate_limit_slot(&queue, &limit).await);
    }
    for _ in 0..3 {
        assert!(!smithy.queues().has_rate_limit_exceeded(&queue, &limit).await.unwrap());
    }
    assert!(smithy.queues().has_rate_limit_exceeded(&queue, &limit).await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_idle_polls_leave_the_rate_limit_window_open() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let limit = QueueRateLimit::new(3, 10_000).unwrap();
    smithy.queues().set_rate_limit(&queue, limit).await.unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let mut consumer = smithy.consumer();
    consumer.consume(&queue, None, counting_handler(seen.clone())).unwrap();
    consumer.run().await.unwrap();

    // plenty of empty polls before anything is produced
    tokio::time::sleep(Duration::from_millis(800)).await;
    for _ in 0..3 {
        smithy.producer().produce(message(&queue)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(800)).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 3);
    assert_eq!(smithy.queues().get_message_counts(&queue).await.unwrap().pending, 0);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_consumer_pauses_when_rate_limited() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    smithy
        .queues()
        .set_rate_limit(&queue, QueueRateLimit::new(2, 10_000).unwrap())
        .await
        .unwrap();
    for _ in 0..5 {
        smithy.producer().produce(message(&queue)).await.unwrap();
    }

    let seen = Arc::new(AtomicUsize::new(0));
    let mut consumer = smithy.consumer();
    consumer.consume(&queue, None, counting_handler(seen.clone())).unwrap();
    consumer.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 2);
    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.acknowledged, 2);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_unreadable_message_is_given_back() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let id = smithy.producer().produce(message(&queue)).await.unwrap().remove(0);

    let mut conn = smithy.redis().connection();
    let _: () = conn
        .hset(smithy.redis().keys().message(id.as_str()), "message", "{not json")
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let mut consumer = smithy.consumer();
    consumer.consume(&queue, None, counting_handler(seen.clone())).unwrap();
    consumer.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(
        smithy.messages().get_message_status(&id).await.unwrap(),
        MessageStatus::UnackDelaying
    );
    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.processing, 0);
    assert_eq!(counts.delayed, 1);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_expired_message_is_dead_lettered() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let id = smithy
        .producer()
        .produce(message(&queue).set_ttl(100))
        .await
        .unwrap()
        .remove(0);
    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let mut consumer = smithy.consumer();
    consumer.consume(&queue, None, counting_handler(seen.clone())).unwrap();
    consumer.run().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    consumer.shutdown().await.unwrap();

    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(
        smithy.messages().get_message_status(&id).await.unwrap(),
        MessageStatus::DeadLettered
    );
    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.dead_lettered, 1);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_priority_queue_pops_lowest_value_first() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Priority, DeliveryModel::PointToPoint).await;

    let mut by_priority = Vec::new();
    for priority in [5, 1, 3] {
        let id = smithy
            .producer()
            .produce(message(&queue).set_priority(priority))
            .await
            .unwrap()
            .remove(0);
        by_priority.push((priority, id));
    }
    by_priority.sort();

    for (_, expected) in by_priority {
        let id = smithy.storage().checkout(&queue, None, "consumer-1").await.unwrap();
        assert_eq!(id, Some(expected));
    }
    assert_eq!(smithy.storage().checkout(&queue, None, "consumer-1").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_lifo_queue_pops_newest_first() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Lifo, DeliveryModel::PointToPoint).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.extend(smithy.producer().produce(message(&queue)).await.unwrap());
    }
    for expected in ids.into_iter().rev() {
        let id = smithy.storage().checkout(&queue, None, "consumer-1").await.unwrap();
        assert_eq!(id, Some(expected));
    }
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_delayed_message_is_published_once() {
    let smithy = connect(events::noop(), true).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    smithy
        .producer()
        .produce(message(&queue).set_schedule_delay(200))
        .await
        .unwrap();
    assert_eq!(smithy.queues().get_message_counts(&queue).await.unwrap().scheduled, 1);

    smithy.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    smithy.shutdown().await.unwrap();

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.total, 1);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_repeated_message_fires_count_times() {
    let smithy = connect(events::noop(), true).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    smithy
        .producer()
        .produce(message(&queue).set_schedule_repeat(200, 2))
        .await
        .unwrap();

    smithy.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    smithy.shutdown().await.unwrap();

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.scheduled, 0);
    assert_eq!(counts.pending, 2);
    assert!(counts.is_consistent());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_cron_message_keeps_its_template() {
    let smithy = connect(events::noop(), true).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    let template = smithy
        .producer()
        .produce(message(&queue).set_schedule_cron("* * * * * *"))
        .await
        .unwrap()
        .remove(0);

    smithy.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    smithy.shutdown().await.unwrap();

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert!(counts.pending >= 1);
    assert_eq!(counts.scheduled, 1);
    assert!(counts.is_consistent());
    assert_eq!(
        smithy.messages().get_message_status(&template).await.unwrap(),
        MessageStatus::Scheduled
    );
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_purge_keeps_held_messages() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    for _ in 0..15 {
        smithy.producer().produce(message(&queue)).await.unwrap();
    }
    let held = smithy.storage().checkout(&queue, None, "consumer-1").await.unwrap().unwrap();

    let job = smithy.purger().purge_queue(&queue).await.unwrap();
    assert_eq!(job.status, PurgeJobStatus::Completed);
    assert_eq!(job.deleted, 14);
    assert_eq!(smithy.purger().get_job(&job.id).await.unwrap(), Some(job));
    assert!(!smithy.state().is_locked(&queue).await.unwrap());

    let counts = smithy.queues().get_message_counts(&queue).await.unwrap();
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.processing, 1);
    assert!(counts.is_consistent());
    assert_eq!(
        smithy.messages().get_message_status(&held).await.unwrap(),
        MessageStatus::Processing
    );
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_lock_of_vanished_purge_job_is_released() {
    let smithy = connect(events::noop(), true).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;
    smithy
        .state()
        .lock(&queue, QueueLockOwner::PurgeJob, "vanished-job", StateTransitionReason::Purge)
        .await
        .unwrap();

    smithy.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(800)).await;
    smithy.shutdown().await.unwrap();

    assert!(!smithy.state().is_locked(&queue).await.unwrap());
    let state = smithy.state().get_state(&queue).await.unwrap();
    assert_eq!(state.to, QueueOperationalState::Active);
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_delete_queue_refusals() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PointToPoint).await;

    let id = smithy.producer().produce(message(&queue)).await.unwrap().remove(0);
    let err = assert_err!(smithy.queues().delete_queue(&queue).await);
    assert!(matches!(err, SmithyError::QueueNotEmpty { .. }));
    smithy.messages().delete_message_by_id(&id).await.unwrap();

    let mut consumer = smithy.consumer();
    consumer
        .consume(&queue, None, counting_handler(Arc::new(AtomicUsize::new(0))))
        .unwrap();
    consumer.run().await.unwrap();
    let err = assert_err!(smithy.queues().delete_queue(&queue).await);
    assert!(matches!(err, SmithyError::QueueHasActiveConsumers { .. }));
    consumer.shutdown().await.unwrap();

    assert_ok!(smithy.queues().delete_queue(&queue).await);
    assert!(!smithy.queues().queue_exists(&queue).await.unwrap());
}

#[tokio::test]
#[ignore = "requires running Redis instance"]
async fn test_group_with_delayed_copy_is_not_deleted() {
    let smithy = connect(events::noop(), false).await;
    let queue = queue(&smithy, QueueType::Fifo, DeliveryModel::PubSub).await;
    assert!(smithy.queues().create_consumer_group(&queue, "billing").await.unwrap());

    let id = smithy.producer().produce(message(&queue)).await.unwrap().remove(0);
    let storage = smithy.storage();
    storage.checkout(&queue, Some("billing"), "consumer-1").await.unwrap();
    storage
        .unacknowledge(&queue, "consumer-1", &id, UnacknowledgeReason::ConsumeError)
        .await
        .unwrap();
    assert_eq!(smithy.queues().get_message_counts(&queue).await.unwrap().pending, 0);

    let err = assert_err!(smithy.queues().delete_consumer_group(&queue, "billing").await);
    assert!(matches!(err, SmithyError::ConsumerGroupNotEmpty { .. }));

    smithy.messages().delete_message_by_id(&id).await.unwrap();
    assert_ok!(smithy.queues().delete_consumer_group(&queue, "billing").await);
    assert!(smithy.queues().get_consumer_groups(&queue).await.unwrap().is_empty());
}
