//! End-to-end: simple request/response over the bus.
//!
//! 1. A mock broker is started in-process.
//! 2. An `auth` service registers a `get-me` handler.
//! 3. A `gateway` service issues the request and observes the reply.
//!
//! Covers: simple replies, the empty reply for unknown request types,
//! handler failures surfacing as service errors, and the first-reply
//! timeout.

use sb_service::{InfraConfig, RequestOptions, ServiceBuilder, ServiceError};
use sb_test_utils::MockBroker;
use serde_json::{json, Map};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Harness helpers
// ---------------------------------------------------------------------------

fn infra(broker: &MockBroker) -> InfraConfig {
    InfraConfig {
        addr: broker.addr_string(),
        ping_delay: Duration::from_millis(400),
        ping_timeout: Duration::from_millis(100),
        reconnect: Duration::from_millis(50),
    }
}

/// Wait until the broker sees `count` subscribers on `channel`.
async fn wait_for_subscribers(broker: &MockBroker, channel: &str, count: usize) {
    for _ in 0..200 {
        if broker.subscriber_count(channel) >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{channel} never reached {count} subscribers");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn simple_request_gets_a_simple_reply() {
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

    let reply = gateway.request("auth", "get-me", Map::new()).await.unwrap();
    assert!(!reply.is_stream());
    assert_eq!(reply.content(), Some(json!({"ok": true})));

    // The success counter lands once the handler wrapper finishes.
    for _ in 0..100 {
        if auth.counters().success == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(auth.counters().success, 1);
    assert_eq!(auth.counters().errors, 0);
}

#[tokio::test]
async fn request_fields_reach_the_handler() {
    let broker = MockBroker::start().await.unwrap();

    let _echo = ServiceBuilder::new("echo")
        .infra(infra(&broker))
        .on_request("shout", |req| async move {
            let word = req.field("word").cloned().unwrap_or(json!(""));
            req.send(json!({ "heard": word })).await
        })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:echo@0", 1).await;

    let caller = ServiceBuilder::new("caller")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:caller@0", 1).await;

    let mut data = Map::new();
    data.insert("word".to_owned(), json!("cheese"));
    let reply = caller.request("echo", "shout", data).await.unwrap();
    assert_eq!(reply.content(), Some(json!({"heard": "cheese"})));
}

#[tokio::test]
async fn unknown_request_type_ends_empty() {
    let broker = MockBroker::start().await.unwrap();

    let _auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
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

    let reply = gateway
        .request("auth", "no-such-thing", Map::new())
        .await
        .unwrap();
    assert_eq!(reply.content(), None);
}

#[tokio::test]
async fn handler_failure_surfaces_as_a_service_error() {
    let broker = MockBroker::start().await.unwrap();

    let auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("explode", |_req| async move {
            Err(ServiceError::handler("database went missing"))
        })
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

    let err = gateway
        .request("auth", "explode", Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Remote), "got {err:?}");

    for _ in 0..100 {
        if auth.counters().errors == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(auth.counters().errors, 1);
    assert_eq!(auth.counters().success, 0);
}

#[tokio::test]
async fn first_reply_timeout_without_a_listener() {
    let broker = MockBroker::start().await.unwrap();

    let gateway = ServiceBuilder::new("gateway")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:gateway@0", 1).await;

    let err = gateway
        .request_with(
            "nobody",
            "anything",
            Map::new(),
            RequestOptions {
                worker: None,
                timeout: Duration::from_millis(150),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Timeout), "got {err:?}");
}
