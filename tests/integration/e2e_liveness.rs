//! End-to-end: healthcheck rounds, peer discovery and round-robin.
//!
//! 1. Two workers of service `a` and one of `b` share a mock broker.
//! 2. `b` runs the ping coordinator; `ping-result` broadcasts teach every
//!    service the full listener map.
//! 3. `b`'s requests to `a` cycle through both workers.
//! 4. Worker `a@1` goes silent; after the next rounds it is never
//!    selected again.

use sb_service::{InfraConfig, RequestOptions, Service, ServiceBuilder};
use sb_test_utils::MockBroker;
use serde_json::{json, Map};
use std::time::{Duration, Instant};

fn infra(broker: &MockBroker) -> InfraConfig {
    InfraConfig {
        addr: broker.addr_string(),
        ping_delay: Duration::from_millis(400),
        ping_timeout: Duration::from_millis(100),
        reconnect: Duration::from_millis(50),
    }
}

async fn wait_for_subscribers(broker: &MockBroker, channel: &str, count: usize) {
    for _ in 0..200 {
        if broker.subscriber_count(channel) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{channel} never reached {count} subscribers");
}

/// Start one `a` worker whose `who` handler reports its worker index.
async fn start_a_worker(broker: &MockBroker, worker: u32) -> Service {
    let service = ServiceBuilder::new("a")
        .worker(worker)
        .infra(infra(broker))
        .on_request("who", |req| async move {
            let worker = req.service().worker();
            req.send(json!(worker)).await
        })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(broker, &format!("service:a@{worker}"), 1).await;
    service
}

fn options() -> RequestOptions {
    RequestOptions {
        worker: None,
        timeout: Duration::from_millis(300),
    }
}

async fn ask_who(b: &Service) -> Result<u64, sb_service::ServiceError> {
    let reply = b.request_with("a", "who", Map::new(), options()).await?;
    Ok(reply.content().and_then(|v| v.as_u64()).unwrap_or(u64::MAX))
}

#[tokio::test]
async fn discovery_and_round_robin_then_dead_worker_is_skipped() {
    let broker = MockBroker::start().await.unwrap();

    let _a0 = start_a_worker(&broker, 0).await;
    let a1 = start_a_worker(&broker, 1).await;
    let b = ServiceBuilder::new("b")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:b@0", 1).await;
    let _coordinator = b.spawn_ping_coordinator();

    // Phase 1: wait until ping-result discovery lets b reach both workers.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut seen = std::collections::BTreeSet::new();
    while seen.len() < 2 {
        assert!(Instant::now() < deadline, "never discovered both workers");
        if let Ok(worker) = ask_who(&b).await {
            seen.insert(worker);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(seen.into_iter().collect::<Vec<_>>(), vec![0, 1]);

    // With both alive, consecutive selections alternate.
    let first = ask_who(&b).await.unwrap();
    let second = ask_who(&b).await.unwrap();
    let third = ask_who(&b).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(first, third);

    // Phase 2: a@1 goes silent (drained and stopped, pings included).
    a1.shutdown().await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Every selection from here on lands on the surviving worker.
    for _ in 0..6 {
        assert_eq!(ask_who(&b).await.unwrap(), 0);
    }
}

#[tokio::test]
async fn pong_counters_reset_each_round() {
    let broker = MockBroker::start().await.unwrap();

    let auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("get-me", |req| async move { req.send(json!({"ok": true})).await })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:auth@0", 1).await;

    let gateway = ServiceBuilder::new("gateway")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:gateway@0", 1).await;

    gateway.request("auth", "get-me", Map::new()).await.unwrap();
    for _ in 0..100 {
        if auth.counters().success == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(auth.counters().success, 1);

    // A ping swaps the counters out for the pong report.
    let _coordinator = gateway.spawn_ping_coordinator();
    let deadline = Instant::now() + Duration::from_secs(3);
    while auth.counters().success != 0 {
        assert!(Instant::now() < deadline, "counters never reset");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(auth.next_ping_at().is_some(), "ping arrival never recorded");
}
