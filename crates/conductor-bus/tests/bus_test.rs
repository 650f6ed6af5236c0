//! Integration tests for the message bus
//!
//! Covers routing, request/response correlation, TTL expiry, dead letters,
//! subscription limits and teardown through the public API only.

use chrono::Utc;
use conductor_bus::{
    BusConfig, BusError, BusEvent, FnMiddleware, Message, MessageBus, MessageHandler,
    MessageKind, Priority, SendOptions, SubscribeOptions, NO_MATCHING_SUBSCRIPTION,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn counting(count: Arc<AtomicUsize>) -> impl MessageHandler {
    move |_msg: Message| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        }
    }
}

#[tokio::test]
async fn test_single_wildcard_publish() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("guardian.*", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    bus.publish("lyria", "guardian.shinkami", json!({}), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    // Too deep for a single wildcard; broadcasts are never dead-lettered
    bus.publish("lyria", "guardian.shinkami.task", json!({}), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_globstar_publish() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("guardian.**", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    for topic in ["guardian", "guardian.shinkami", "guardian.shinkami.task", "council.vote"] {
        bus.publish("lyria", topic, json!(null), SendOptions::new())
            .await
            .unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_unroutable_send_is_dead_lettered_once() {
    let bus = MessageBus::default();

    bus.send("lyria", "unknown-agent", "nobody.listens", json!({"x": 1}), SendOptions::new())
        .await
        .unwrap();

    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, NO_MATCHING_SUBSCRIPTION);
    assert_eq!(dead[0].attempts, 1);

    // Retrying the same message bumps attempts instead of adding an entry
    bus.redeliver(dead[0].message.clone()).await.unwrap();

    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert_eq!(bus.stats().dead_letter_count, 1);
}

#[tokio::test]
async fn test_handler_failure_does_not_stop_fan_out() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "task.*",
        |_msg: Message| async move { Err::<(), _>(anyhow::anyhow!("boom")) },
        SubscribeOptions::new(),
    )
    .unwrap();
    bus.subscribe("task.*", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    bus.send("a", "b", "task.run", json!(null), SendOptions::new())
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);

    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "Handler error: boom");

    let stats = bus.stats();
    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_delivered, 1);
    assert_eq!(stats.total_failed, 1);
}

#[tokio::test]
async fn test_subscribe_unsubscribe_restores_count() {
    let bus = MessageBus::default();
    bus.subscribe("a.b", counting(Arc::default()), SubscribeOptions::new())
        .unwrap();
    let before = bus.stats().active_subscriptions;

    let id = tokio_test::assert_ok!(bus.subscribe(
        "c.*",
        counting(Arc::default()),
        SubscribeOptions::new()
    ));
    assert_eq!(bus.stats().active_subscriptions, before + 1);
    assert_eq!(bus.subscriptions_for("c.*"), vec![id.clone()]);

    assert!(bus.unsubscribe(&id));
    assert_eq!(bus.stats().active_subscriptions, before);
    assert!(bus.subscriptions_for("c.*").is_empty());

    assert!(!bus.unsubscribe(&id));
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let bus = MessageBus::default();
    let responder = bus.clone();

    bus.subscribe(
        "math.double",
        move |msg: Message| {
            let bus = responder.clone();
            async move {
                let n = msg.payload.as_i64().unwrap_or_default();
                bus.reply(&msg, json!(n * 2), SendOptions::new()).await?;
                Ok::<_, anyhow::Error>(())
            }
        },
        SubscribeOptions::new(),
    )
    .unwrap();

    let response = bus
        .request("client", "calculator", "math.double", json!(21), SendOptions::new())
        .await
        .unwrap();

    assert_eq!(response.kind, MessageKind::Response);
    assert_eq!(response.payload, json!(42));
    assert_eq!(response.from, "calculator");
    assert_eq!(response.to, "client");
    assert_eq!(response.topic, "math.double");
    assert_eq!(bus.stats().in_flight_count, 0);
    assert!(bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_request_timeout_restores_in_flight() {
    let bus = MessageBus::default();
    bus.subscribe("ping", counting(Arc::default()), SubscribeOptions::new())
        .unwrap();
    assert_eq!(bus.stats().in_flight_count, 0);

    let pending = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.request("a", "b", "ping", json!(null), SendOptions::new().timeout_ms(50))
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(bus.stats().in_flight_count, 1);

    let result = pending.await.unwrap();
    assert_eq!(
        result.unwrap_err(),
        BusError::Timeout {
            topic: "ping".to_string(),
            timeout_ms: 50
        }
    );
    assert_eq!(bus.stats().in_flight_count, 0);
}

#[tokio::test]
async fn test_backpressure_refuses_excess_requests() {
    let bus = MessageBus::new(BusConfig {
        max_in_flight: 1,
        ..BusConfig::default()
    });

    let first = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.request("a", "b", "slow", json!(null), SendOptions::new().timeout_ms(100))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let second = bus
        .request("a", "b", "slow", json!(null), SendOptions::new().timeout_ms(100))
        .await;
    assert_eq!(
        second.unwrap_err(),
        BusError::Backpressure {
            in_flight: 1,
            limit: 1
        }
    );

    assert!(matches!(first.await.unwrap(), Err(BusError::Timeout { .. })));
}

#[tokio::test]
async fn test_expired_message_is_never_delivered() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("status", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    // Backdate messages so their TTL has already elapsed at delivery
    bus.use_middleware(FnMiddleware::new(|msg: &mut Message| {
        msg.timestamp = Utc::now() - chrono::Duration::seconds(60);
        Ok(())
    }))
    .unwrap();

    bus.send("a", "b", "status", json!(null), SendOptions::new().ttl_ms(1000))
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 0);
    let stats = bus.stats();
    assert_eq!(stats.total_expired, 1);
    assert_eq!(stats.total_sent, 0);
    assert!(bus.dead_letters().is_empty());

    // A zero TTL never expires
    bus.send("a", "b", "status", json!(null), SendOptions::new().ttl_ms(0))
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_max_messages_auto_unsubscribes() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        "tick",
        counting(count.clone()),
        SubscribeOptions::new().max_messages(2),
    )
    .unwrap();

    for _ in 0..5 {
        bus.publish("clock", "tick", json!(null), SendOptions::new())
            .await
            .unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(bus.subscription_count(), 0);
    assert!(bus.subscriptions_for("tick").is_empty());
}

#[tokio::test]
async fn test_max_messages_holds_under_concurrent_sends() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    let seen = count.clone();

    bus.subscribe(
        "work",
        move |_msg: Message| {
            let seen = seen.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        },
        SubscribeOptions::new().max_messages(3),
    )
    .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let bus = bus.clone();
        handles.push(tokio::spawn(async move {
            bus.publish("a", "work", json!(null), SendOptions::new()).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(bus.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_predicates() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe(
        "alerts",
        counting(count.clone()),
        SubscribeOptions::new()
            .from_agents(["draconia"])
            .min_priority(Priority::High),
    )
    .unwrap();

    let urgent = SendOptions::new().priority(Priority::Critical);
    bus.publish("draconia", "alerts", json!(null), urgent.clone())
        .await
        .unwrap();
    bus.publish("lyria", "alerts", json!(null), urgent)
        .await
        .unwrap();
    bus.publish("draconia", "alerts", json!(null), SendOptions::new())
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_middleware_rejection_aborts_send() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("secret", counting(count.clone()), SubscribeOptions::new())
        .unwrap();
    bus.use_middleware(FnMiddleware::new(|msg: &mut Message| {
        if msg.topic == "secret" {
            anyhow::bail!("forbidden topic");
        }
        Ok(())
    }))
    .unwrap();

    let result = bus
        .send("a", "b", "secret", json!(null), SendOptions::new())
        .await;

    assert!(matches!(result, Err(BusError::Middleware(reason)) if reason.contains("forbidden")));
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert_eq!(bus.stats().total_sent, 0);
}

#[tokio::test]
async fn test_reply_requires_correlation_id() {
    let bus = MessageBus::default();
    let plain = Message::new("a", "b", "t", json!(null));

    let result = bus.reply(&plain, json!("nope"), SendOptions::new()).await;
    assert!(matches!(result, Err(BusError::MissingCorrelationId { .. })));
}

#[tokio::test]
async fn test_history_is_bounded() {
    let bus = MessageBus::new(BusConfig {
        track_history: true,
        max_history: 2,
        ..BusConfig::default()
    });

    for topic in ["one", "two", "three"] {
        bus.publish("a", topic, json!(null), SendOptions::new())
            .await
            .unwrap();
    }

    let topics: Vec<_> = bus.history().into_iter().map(|m| m.topic).collect();
    assert_eq!(topics, vec!["two", "three"]);
}

#[tokio::test]
async fn test_events_are_emitted() {
    let bus = MessageBus::default();
    let mut events = bus.events();

    bus.subscribe("t", counting(Arc::default()), SubscribeOptions::new())
        .unwrap();
    bus.send("a", "b", "t", json!(null), SendOptions::new())
        .await
        .unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert_eq!(
        names,
        vec!["subscription:added", "message:sent", "message:delivered"]
    );
}

#[tokio::test]
async fn test_destroy_rejects_pending_requests() {
    let bus = MessageBus::default();
    bus.subscribe("t", counting(Arc::default()), SubscribeOptions::new())
        .unwrap();
    bus.send("a", "nobody", "void", json!(null), SendOptions::new())
        .await
        .unwrap();

    let pending = {
        let bus = bus.clone();
        tokio::spawn(async move {
            bus.request("a", "b", "t", json!(null), SendOptions::new().timeout_ms(5_000))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    bus.destroy();

    assert_eq!(pending.await.unwrap().unwrap_err(), BusError::Destroyed);
    assert!(bus.is_destroyed());
    assert_eq!(bus.stats(), Default::default());
    assert!(bus.dead_letters().is_empty());

    let after = bus.send("a", "b", "t", json!(null), SendOptions::new()).await;
    assert_eq!(after.unwrap_err(), BusError::Destroyed);
    let after = bus.subscribe("t", counting(Arc::default()), SubscribeOptions::new());
    assert_eq!(after.unwrap_err(), BusError::Destroyed);
}

#[tokio::test]
async fn test_dead_letter_events_and_clear() {
    let bus = MessageBus::default();
    let mut events = bus.events();

    bus.send("a", "nobody", "void", json!(null), SendOptions::new())
        .await
        .unwrap();

    let mut saw_dead_letter = false;
    while let Ok(event) = events.try_recv() {
        if let BusEvent::DeadLetterAdded { reason, .. } = event {
            assert_eq!(reason, NO_MATCHING_SUBSCRIPTION);
            saw_dead_letter = true;
        }
    }
    assert!(saw_dead_letter);

    assert_eq!(bus.clear_dead_letters(), 1);
    assert!(bus.dead_letters().is_empty());
}

#[tokio::test]
async fn test_huge_ttl_is_delivered() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));
    bus.subscribe("t", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    bus.send("a", "b", "t", json!(null), SendOptions::new().ttl_ms(u64::MAX))
        .await
        .unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(bus.stats().total_expired, 0);
}

#[tokio::test]
async fn test_panicking_handler_is_contained() {
    let bus = MessageBus::default();
    let count = Arc::new(AtomicUsize::new(0));

    bus.subscribe(
        "task.*",
        |msg: Message| async move {
            if msg.payload["explode"] == true {
                panic!("handler blew up");
            }
            Ok::<_, anyhow::Error>(())
        },
        SubscribeOptions::new(),
    )
    .unwrap();
    bus.subscribe("task.*", counting(count.clone()), SubscribeOptions::new())
        .unwrap();

    bus.send("a", "b", "task.run", json!({"explode": true}), SendOptions::new())
        .await
        .unwrap();

    // The second subscriber still ran
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let dead = bus.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, "Handler error: handler panicked");

    let stats = bus.stats();
    assert_eq!(stats.total_failed, 1);
    assert_eq!(stats.total_delivered, 1);
    assert_eq!(stats.active_subscriptions, 2);

    // The bus keeps working afterwards
    bus.send("a", "b", "task.run", json!({"explode": false}), SendOptions::new())
        .await
        .unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 2);
    assert_eq!(bus.stats().total_delivered, 3);
}

#[tokio::test]
async fn test_stats_track_deliveries_and_latency() {
    let bus = MessageBus::default();
    assert_eq!(bus.stats().avg_delivery_ms, 0.0);

    bus.subscribe(
        "work",
        |_msg: Message| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok::<_, anyhow::Error>(())
        },
        SubscribeOptions::new(),
    )
    .unwrap();
    bus.subscribe(
        "work",
        |_msg: Message| async move { Err::<(), _>(anyhow::anyhow!("nope")) },
        SubscribeOptions::new(),
    )
    .unwrap();

    for _ in 0..2 {
        bus.send("a", "b", "work", json!(null), SendOptions::new())
            .await
            .unwrap();
    }

    let stats = bus.stats();
    assert_eq!(stats.total_sent, 2);
    assert_eq!(stats.total_delivered, 2);
    assert_eq!(stats.total_failed, 2);
    assert_eq!(stats.in_flight_count, 0);
    assert!(
        stats.avg_delivery_ms >= 20.0,
        "average {}ms below handler time",
        stats.avg_delivery_ms
    );
}
