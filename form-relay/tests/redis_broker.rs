//! Runs against a live server: `REDIS_URL=redis://127.0.0.1:6379 cargo test
//! --features redis -- --ignored`

#![cfg(feature = "redis")]

use std::time::Duration;

use form_relay::broker::PublishProperties;
use form_relay::{Broker, BrokerConnection, RedisBroker};

fn broker() -> Option<RedisBroker> {
    let url = std::env::var("REDIS_URL").ok()?;
    Some(RedisBroker::new(&url).unwrap())
}

fn queue() -> String {
    format!("form_relay_test_{}", uuid::Uuid::new_v4().simple())
}

fn properties() -> PublishProperties {
    PublishProperties {
        persistent: true,
        content_type: "application/json",
        message_id: uuid::Uuid::new_v4().to_string(),
    }
}

#[tokio::test]
#[ignore]
async fn publish_deliver_ack() {
    let Some(broker) = broker() else {
        return;
    };
    let queue = queue();
    let mut conn = broker.open().await.unwrap();
    conn.declare_queue(&queue, true).await.unwrap();

    conn.publish(&queue, b"first", &properties()).await.unwrap();
    conn.publish(&queue, b"second", &properties()).await.unwrap();

    let first = conn
        .next_delivery(&queue, 0, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.body, b"first");
    conn.ack(&first.tag).await.unwrap();

    let second = conn
        .next_delivery(&queue, 0, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.body, b"second");
    conn.nack(&second.tag, true).await.unwrap();

    assert_eq!(conn.purge(&queue).await.unwrap(), 1);
    conn.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn deliveries_of_a_dead_consumer_are_recovered() {
    let Some(broker) = broker() else {
        return;
    };
    let queue = queue();
    let short_lived = broker.clone().with_heartbeat_ttl(Duration::from_secs(1));

    let mut dead = short_lived.open().await.unwrap();
    dead.declare_queue(&queue, true).await.unwrap();
    dead.publish(&queue, b"orphan", &properties()).await.unwrap();
    let delivery = dead
        .next_delivery(&queue, 0, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(delivery.is_some());
    // Gone without close: the delivery stays on its processing list
    drop(dead);

    let mut live = broker.open().await.unwrap();
    assert_eq!(live.recover_orphans(&queue).await.unwrap(), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(live.recover_orphans(&queue).await.unwrap(), 1);
    let again = live
        .next_delivery(&queue, 0, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.body, b"orphan");
    live.ack(&again.tag).await.unwrap();

    assert_eq!(live.recover_orphans(&queue).await.unwrap(), 0);
    live.purge(&queue).await.unwrap();
    live.close().await.unwrap();
}
