//! End-to-end: streamed responses.
//!
//! A stream is one `stream` opener, zero or more `content` frames and
//! exactly one terminator; nothing may follow the terminator.

use sb_proto::envelope::{Body, Envelope};
use sb_service::{InfraConfig, ServiceBuilder, ServiceError};
use sb_test_utils::MockBroker;
use serde_json::{json, Map};
use std::time::Duration;

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

/// Count terminal response frames the broker saw for a given request id.
fn terminators_for(broker: &MockBroker, request_id: &str) -> usize {
    broker
        .published()
        .iter()
        .filter_map(|(_, payload)| Envelope::from_json(payload).ok())
        .filter_map(|envelope| match envelope.body {
            Body::Response(body) if body.request_id == request_id => Some(body.response_type),
            _ => None,
        })
        .filter(|response_type| response_type.is_terminal())
        .count()
}

fn sent_request_ids(broker: &MockBroker) -> Vec<String> {
    broker
        .published()
        .iter()
        .filter_map(|(_, payload)| Envelope::from_json(payload).ok())
        .filter_map(|envelope| match envelope.body {
            Body::Request(body) => Some(body.request_id),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn stream_yields_content_then_terminates() {
    let broker = MockBroker::start().await.unwrap();

    let _lister = ServiceBuilder::new("changelogs")
        .infra(infra(&broker))
        .on_request("list", |req| async move {
            req.open_stream().await?;
            req.send(json!("a")).await?;
            req.send(json!("b")).await?;
            req.end().await
        })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:changelogs@0", 1).await;

    let caller = ServiceBuilder::new("caller")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:caller@0", 1).await;

    let reply = caller
        .request("changelogs", "list", Map::new())
        .await
        .unwrap();
    let mut stream = reply.into_stream().expect("expected a stream reply");
    assert_eq!(stream.next().await.unwrap(), Some(json!("a")));
    assert_eq!(stream.next().await.unwrap(), Some(json!("b")));
    assert_eq!(stream.next().await.unwrap(), None);
    // Exhausted streams keep terminating normally.
    assert_eq!(stream.next().await.unwrap(), None);
}

#[tokio::test]
async fn stream_error_raises_on_the_consumer() {
    let broker = MockBroker::start().await.unwrap();

    let _lister = ServiceBuilder::new("changelogs")
        .infra(infra(&broker))
        .on_request("list", |req| async move {
            req.open_stream().await?;
            req.send(json!("a")).await?;
            req.error().await
        })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:changelogs@0", 1).await;

    let caller = ServiceBuilder::new("caller")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:caller@0", 1).await;

    let reply = caller
        .request("changelogs", "list", Map::new())
        .await
        .unwrap();
    let mut stream = reply.into_stream().expect("expected a stream reply");
    assert_eq!(stream.next().await.unwrap(), Some(json!("a")));
    assert!(matches!(stream.next().await, Err(ServiceError::Remote)));
}

#[tokio::test]
async fn exactly_one_terminator_even_with_noisy_handlers() {
    let broker = MockBroker::start().await.unwrap();

    // The handler keeps talking after its simple reply; every extra frame
    // must be swallowed as a no-op.
    let _auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("get-me", |req| async move {
            req.send(json!({"ok": true})).await?;
            req.send(json!({"ok": "again"})).await?;
            req.end().await?;
            req.error().await
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

    let reply = gateway.request("auth", "get-me", Map::new()).await.unwrap();
    assert_eq!(reply.content(), Some(json!({"ok": true})));

    // Give the handler wrapper time to (not) emit anything further.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let request_ids = sent_request_ids(&broker);
    assert_eq!(request_ids.len(), 1);
    assert_eq!(terminators_for(&broker, &request_ids[0]), 1);
}

#[tokio::test]
async fn collect_drains_a_stream() {
    let broker = MockBroker::start().await.unwrap();

    let _lister = ServiceBuilder::new("changelogs")
        .infra(infra(&broker))
        .on_request("list", |req| async move {
            req.open_stream().await?;
            for n in 0..5 {
                req.send(json!(n)).await?;
            }
            req.end().await
        })
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:changelogs@0", 1).await;

    let caller = ServiceBuilder::new("caller")
        .infra(infra(&broker))
        .start()
        .await
        .unwrap();
    wait_for_subscribers(&broker, "service:caller@0", 1).await;

    let items = caller
        .request("changelogs", "list", Map::new())
        .await
        .unwrap()
        .into_stream()
        .expect("expected a stream reply")
        .collect()
        .await
        .unwrap();
    assert_eq!(items, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}
