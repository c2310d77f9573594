//! End-to-end: typed rejections.
//!
//! A handler translates a domain problem into `reject(kind, …)`; the
//! caller observes the kind and arguments.  Rejections are always
//! terminal and illegal once a stream is open.

use sb_service::{rejection, InfraConfig, ServiceBuilder, ServiceError};
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

#[tokio::test]
async fn rejection_kind_and_message_surface() {
    let broker = MockBroker::start().await.unwrap();

    let _auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("refresh", |req| async move {
            req.reject(rejection::EXPIRED_TOKEN, [json!("Token has expired")])
                .await
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
        .request("auth", "refresh", Map::new())
        .await
        .unwrap_err();
    let ServiceError::Rejected(rejected) = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(rejected.kind, rejection::EXPIRED_TOKEN);
    assert_eq!(rejected.message(), Some("Token has expired"));
}

#[tokio::test]
async fn unknown_rejection_kinds_pass_through() {
    let broker = MockBroker::start().await.unwrap();

    let _auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("custom", |req| async move {
            req.reject("TeapotRefusal", [json!(418)]).await
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
        .request("auth", "custom", Map::new())
        .await
        .unwrap_err();
    let ServiceError::Rejected(rejected) = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(rejected.kind, "TeapotRefusal");
    assert_eq!(rejected.args, vec![json!(418)]);
}

#[tokio::test]
async fn reject_is_illegal_after_streaming() {
    let broker = MockBroker::start().await.unwrap();

    let _lister = ServiceBuilder::new("changelogs")
        .infra(infra(&broker))
        .on_request("list", |req| async move {
            req.open_stream().await?;
            let err = req
                .reject(rejection::NOT_FOUND, [json!("too late")])
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::InvalidTransition(_)));
            // The stream is still usable and terminates normally.
            req.send(json!("still-here")).await?;
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
    assert_eq!(items, vec![json!("still-here")]);
}

#[tokio::test]
async fn rejection_kwargs_ride_along() {
    let broker = MockBroker::start().await.unwrap();

    let _auth = ServiceBuilder::new("auth")
        .infra(infra(&broker))
        .on_request("sanction", |req| async move {
            let mut kwargs = Map::new();
            kwargs.insert("until".to_owned(), json!("2030-01-01"));
            req.reject_with(rejection::FORBIDDEN, [json!("sanctioned")], kwargs)
                .await
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
        .request("auth", "sanction", Map::new())
        .await
        .unwrap_err();
    let ServiceError::Rejected(rejected) = err else {
        panic!("expected a rejection, got {err:?}");
    };
    assert_eq!(rejected.kwargs.get("until"), Some(&json!("2030-01-01")));
}
