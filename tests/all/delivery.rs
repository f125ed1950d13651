use crate::helpers::{
    declare_queue, delivery_settings, get_delivery_service, get_pool_manager, payloads,
    pool_settings,
};
use std::time::Duration;
use warren::configuration::DeliverySettings;
use warren::delivery::{DeliveryError, DeliveryService};
use warren::random::RandomData;
use warren::transport::memory::InMemoryBroker;
use warren::transport::{PublishOptions, TransportErrorKind};

fn data(deliveries: &[warren::transport::Delivery]) -> Vec<Vec<u8>> {
    deliveries.iter().map(|d| d.data.clone()).collect()
}

#[tokio::test]
async fn a_published_message_is_received_unchanged() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payload = RandomData::from_entropy().payload(1000);

    assert!(service.publish("", &queue_name, &payload).await.unwrap());
    let delivery = service.get(&queue_name).await.unwrap().unwrap();

    assert_eq!(delivery.data, payload);
    assert_eq!(delivery.routing_key.as_str(), queue_name);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
    assert!(service.get(&queue_name).await.unwrap().is_none());
}

#[tokio::test]
async fn publish_many_preserves_the_submission_order() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(25);

    let failures = service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();
    let deliveries = service.get_many(&queue_name, payloads.len()).await.unwrap();

    assert!(failures.is_empty());
    assert_eq!(data(&deliveries), payloads);
}

#[tokio::test]
async fn publish_many_reports_the_positions_of_failed_payloads() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(10);
    broker.fail_sends_matching(TransportErrorKind::Transient, |payload| {
        payload == b"message-3" || payload == b"message-7"
    });

    let failures = service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();

    assert_eq!(failures, vec![3, 7]);
    assert_eq!(broker.queue_depth(&queue_name), Some(8));
    // Transient failures leave the channel in circulation.
    assert_eq!(broker.channels_opened(), pool_settings().channel_pool_count);
}

#[tokio::test]
async fn publish_many_carries_on_after_its_channel_dies() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(10);
    broker.fail_sends_matching(TransportErrorKind::Closed, |payload| payload == b"message-4");

    let failures = service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();

    assert_eq!(failures, vec![4]);
    let mut expected = payloads.clone();
    expected.remove(4);
    let deliveries = service.get_all(&queue_name).await.unwrap();
    assert_eq!(data(&deliveries), expected);

    // The dead channel left the pool, its replacement is opened lazily.
    let status = service.pool().status().standard;
    assert_eq!(status.size, status.capacity - 1);
    assert_eq!(status.checked_out, 0);
}

#[tokio::test]
async fn batches_are_published_in_order_with_absolute_failure_positions() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(23);
    broker.fail_sends_matching(TransportErrorKind::Transient, |payload| {
        payload == b"message-12"
    });

    let failures = service
        .publish_many_as_batches("", &queue_name, &payloads, Some(5))
        .await
        .unwrap();

    assert_eq!(failures, vec![12]);
    let deliveries = service.get_all(&queue_name).await.unwrap();
    assert_eq!(deliveries.len(), 22);
    assert_eq!(deliveries[12].data, b"message-13");
}

#[tokio::test]
async fn parallel_batches_deliver_every_payload_exactly_once() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(95);
    broker.fail_sends_matching(TransportErrorKind::Closed, |payload| {
        payload == b"message-41" || payload == b"message-90"
    });

    let failures = service
        .publish_many_as_batches_in_parallel("", &queue_name, &payloads, Some(10))
        .await
        .unwrap();

    assert_eq!(failures, vec![41, 90]);
    let mut received = data(&service.get_all(&queue_name).await.unwrap());
    received.sort();
    let mut expected: Vec<Vec<u8>> = payloads
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != 41 && *i != 90)
        .map(|(_, payload)| payload)
        .collect();
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn get_many_never_returns_more_than_requested_or_queued() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(10);
    service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();

    let first = service.get_many(&queue_name, 4).await.unwrap();
    let rest = service.get_many(&queue_name, 100).await.unwrap();
    let nothing = service.get_many(&queue_name, 100).await.unwrap();

    assert_eq!(data(&first), payloads[..4]);
    assert_eq!(data(&rest), payloads[4..]);
    assert!(nothing.is_empty());
}

#[tokio::test]
async fn concurrent_drains_share_the_queue_without_errors() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(60);
    service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();

    let (first, second) = tokio::join!(
        service.get_many(&queue_name, 60),
        service.get_many(&queue_name, 60)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.len() + second.len(), 60);
    let mut received = data(&first);
    received.extend(data(&second));
    received.sort();
    let mut expected = payloads;
    expected.sort();
    assert_eq!(received, expected);
}

#[tokio::test]
async fn message_count_reports_the_queue_depth() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service
        .publish_many("", &queue_name, &payloads(7))
        .await
        .unwrap();

    assert_eq!(service.message_count(&queue_name).await.unwrap(), 7);
    assert!(service.message_count("missing").await.is_err());
}

#[tokio::test]
async fn ackable_gets_are_acknowledged_by_the_caller() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service
        .publish_many("", &queue_name, &payloads(3))
        .await
        .unwrap();

    let mut result = service.get_many_with_ack(&queue_name, 10).await.unwrap();
    assert_eq!(result.len(), 3);
    assert!(result.channel().unwrap().is_ackable());
    assert_eq!(broker.unacked_count(), 3);

    result.ack_all().await.unwrap();
    assert_eq!(result.unsettled(), 0);
    assert_eq!(broker.unacked_count(), 0);
    result.release().await;

    assert_eq!(broker.queue_depth(&queue_name), Some(0));
    assert_eq!(service.pool().status().ackable.checked_out, 0);
}

#[tokio::test]
async fn a_nacked_delivery_goes_back_to_the_queue() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"retry me").await.unwrap();

    let mut result = service.get_with_ack(&queue_name).await.unwrap();
    let delivery = result.first().unwrap().clone();
    result.nack(&delivery, true).await.unwrap();
    result.release().await;

    let redelivered = service.get(&queue_name).await.unwrap().unwrap();
    assert_eq!(redelivered.data, b"retry me");
    assert!(redelivered.redelivered);
}

#[tokio::test]
async fn an_empty_queue_yields_an_empty_ackable_result() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;

    let mut result = service.get_with_ack(&queue_name).await.unwrap();

    assert!(result.is_empty());
    result.ack_all().await.unwrap();
    result.release().await;
    assert_eq!(service.pool().status().ackable.idle, 1);
}

#[tokio::test]
async fn unroutable_mandatory_messages_are_reported_as_failures() {
    let broker = InMemoryBroker::new();
    let service = get_delivery_service(&broker).await;
    let options = PublishOptions {
        mandatory: true,
        ..PublishOptions::default()
    };

    let published = service
        .publish_with_options("", "nowhere", b"lost", &options)
        .await
        .unwrap();

    assert!(!published);
    let status = service.pool().status().standard;
    assert_eq!(status.size, status.capacity);
}

#[tokio::test]
async fn failures_are_swallowed_unless_errors_propagate() {
    let broker = InMemoryBroker::new();
    let pool = get_pool_manager(&broker, &pool_settings()).await;
    let swallowing = DeliveryService::new(pool.clone(), delivery_settings());
    let propagating = DeliveryService::new(
        pool,
        DeliverySettings {
            propagate_errors: true,
            ..delivery_settings()
        },
    );

    assert!(swallowing.get("missing").await.unwrap().is_none());
    assert!(swallowing.get_many("missing", 5).await.unwrap().is_empty());
    assert!(swallowing.get_with_ack("missing").await.unwrap().is_empty());

    assert!(matches!(
        propagating.get("missing").await,
        Err(DeliveryError::Transport(_))
    ));
    assert!(matches!(
        propagating.get_many("missing", 5).await,
        Err(DeliveryError::Transport(_))
    ));
    assert!(propagating.get_with_ack("missing").await.is_err());

    // Every channel made it back to its pool.
    let status = propagating.pool().status();
    assert_eq!(status.standard.checked_out, 0);
    assert_eq!(status.ackable.checked_out, 0);
}

#[tokio::test]
async fn operations_fail_once_the_pools_are_shut_down() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;

    service.shutdown().await;

    assert!(matches!(
        service.publish("", &queue_name, b"late").await,
        Err(DeliveryError::Pool(_))
    ));
    assert_eq!(broker.open_channels(), 0);
}

#[tokio::test]
async fn the_round_trip_scenario_holds_on_the_in_memory_broker() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = RandomData::from_entropy().payloads(17, Some(1000));

    let failures = service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();

    assert!(failures.is_empty());
    assert_eq!(service.message_count(&queue_name).await.unwrap(), 17);
    let deliveries = service.get_many(&queue_name, 17).await.unwrap();
    assert_eq!(data(&deliveries), payloads);
    assert!(broker.delete_queue(&queue_name));
}

#[tokio::test]
async fn ack_all_only_settles_the_deliveries_of_its_own_result() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service
        .publish_many("", &queue_name, &payloads(2))
        .await
        .unwrap();

    let first = service.get_with_ack(&queue_name).await.unwrap();
    let mut second = service.get_with_ack(&queue_name).await.unwrap();
    second.ack_all().await.unwrap();

    assert_eq!(first.unsettled(), 1);
    assert_eq!(broker.unacked_count(), 1);
    second.release().await;
    first.release().await;
}

#[tokio::test]
async fn unsettled_deliveries_are_requeued_instead_of_reaching_the_next_borrower() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service
        .publish_many("", &queue_name, &payloads(2))
        .await
        .unwrap();

    let abandoned = service.get_with_ack(&queue_name).await.unwrap();
    let abandoned_channel = abandoned.channel().unwrap().id();
    abandoned.release().await;

    // The channel holding the unsettled delivery left the pool and was closed.
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(service.pool().status().ackable.size, 0);

    let mut next = service.get_many_with_ack(&queue_name, 10).await.unwrap();
    assert_ne!(next.channel().unwrap().id(), abandoned_channel);
    assert_eq!(next.len(), 2);
    assert_eq!(next.deliveries()[0].data, b"message-0");
    assert!(next.deliveries()[0].redelivered);
    next.ack_all().await.unwrap();
    next.release().await;

    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
}

#[tokio::test]
async fn dropping_an_unsettled_result_requeues_its_deliveries() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"dropped").await.unwrap();

    let result = service.get_with_ack(&queue_name).await.unwrap();
    assert_eq!(broker.unacked_count(), 1);
    drop(result);

    tokio::time::timeout(Duration::from_secs(1), async {
        while broker.unacked_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(broker.queue_depth(&queue_name), Some(1));
    assert_eq!(service.pool().status().ackable.checked_out, 0);
}

#[tokio::test]
async fn a_single_publish_flags_a_closed_channel_dead() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let capacity = pool_settings().channel_pool_count;
    broker.fail_sends_matching(TransportErrorKind::Closed, |_| true);

    let published = service.publish("", &queue_name, b"lost").await.unwrap();

    assert!(!published);
    assert_eq!(service.pool().status().standard.size, capacity - 1);
    assert_eq!(broker.open_channels(), capacity - 1);
    assert_eq!(broker.queue_depth(&queue_name), Some(0));
}

#[tokio::test]
async fn remaining_payloads_fail_when_no_replacement_channel_can_be_checked_out() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let outage = broker.clone();
    // The broker goes away while the fifth payload is being published.
    broker.fail_sends_matching(TransportErrorKind::Closed, move |payload| {
        if payload != b"message-4" {
            return false;
        }
        outage.close_all_connections();
        outage.set_reachable(false);
        true
    });

    let failures = service
        .publish_many("", &queue_name, &payloads(10))
        .await
        .unwrap();

    assert_eq!(failures, (4..10).collect::<Vec<_>>());
    assert_eq!(broker.queue_depth(&queue_name), Some(4));
}

#[tokio::test]
async fn parallel_batches_without_a_channel_are_reported_failed() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let outage = broker.clone();
    broker.fail_sends_matching(TransportErrorKind::Closed, move |payload| {
        if payload != b"message-0" {
            return false;
        }
        outage.close_all_connections();
        outage.set_reachable(false);
        true
    });

    let failures = service
        .publish_many_as_batches_in_parallel("", &queue_name, &payloads(8), Some(1))
        .await
        .unwrap();

    assert_eq!(failures, (0..8).collect::<Vec<_>>());
    assert_eq!(broker.queue_depth(&queue_name), Some(0));

    broker.set_reachable(true);
    assert!(service.publish("", &queue_name, b"back").await.unwrap());
}

#[tokio::test]
async fn a_get_with_ack_on_a_closed_channel_is_an_error() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    service.publish("", &queue_name, b"stuck").await.unwrap();
    broker.fail_receives_matching(TransportErrorKind::Closed, |payload| payload == b"stuck");

    let err = service.get_with_ack(&queue_name).await.err().unwrap();

    assert!(matches!(err, DeliveryError::Transport(e) if e.is_closed()));
    assert_eq!(service.pool().status().ackable.size, 0);
    assert_eq!(broker.queue_depth(&queue_name), Some(1));

    broker.clear_receive_failures();
    let delivery = service.get(&queue_name).await.unwrap().unwrap();
    assert_eq!(delivery.data, b"stuck");
}

#[tokio::test]
async fn a_channel_closing_mid_drain_requeues_what_was_pulled() {
    let broker = InMemoryBroker::new();
    let queue_name = declare_queue(&broker);
    let service = get_delivery_service(&broker).await;
    let payloads = payloads(5);
    service
        .publish_many("", &queue_name, &payloads)
        .await
        .unwrap();
    broker.fail_receives_matching(TransportErrorKind::Closed, |payload| {
        payload == b"message-3"
    });

    let err = service.get_many_with_ack(&queue_name, 10).await.err().unwrap();

    assert!(matches!(err, DeliveryError::Transport(e) if e.is_closed()));
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(service.pool().status().ackable.size, 0);

    broker.clear_receive_failures();
    let deliveries = service.get_all(&queue_name).await.unwrap();
    assert_eq!(data(&deliveries), payloads);
    assert!(deliveries[..3].iter().all(|d| d.redelivered));
    assert!(!deliveries[3].redelivered);
}
