use std::sync::Arc;

use serde_json::{json, Value};
use ws_client::{
    testing::FakeTransportFactory, ClientConfig, ClientState, ClientTransportFactory, QueuePolicy,
    WsClient,
};
use ws_proto::MessageDescriptor;

fn ping() -> MessageDescriptor {
    MessageDescriptor::event("PING")
}

fn config(policy: QueuePolicy, size: usize) -> ClientConfig {
    let mut config = ClientConfig::new("wss://example.test/ws");
    config.queue = policy;
    config.queue_size = size;
    config
}

fn client_with(factory: &Arc<FakeTransportFactory>, config: ClientConfig) -> WsClient {
    let factory = Arc::clone(factory) as Arc<dyn ClientTransportFactory>;
    WsClient::builder("wss://example.test/ws", factory)
        .config(config)
        .build()
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn off_policy_drops_while_disconnected() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = client_with(&factory, config(QueuePolicy::Off, 0));

    assert!(!client.send(&ping(), json!({"id": 1})).await);
    assert_eq!(client.state(), ClientState::Idle);
}

#[tokio::test]
async fn drop_newest_refuses_overflow_while_disconnected() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = client_with(&factory, config(QueuePolicy::DropNewest, 2));

    assert!(client.send(&ping(), json!({"id": 1})).await);
    assert!(client.send(&ping(), json!({"id": 2})).await);
    assert!(!client.send(&ping(), json!({"id": 3})).await);
}

#[tokio::test]
async fn drop_oldest_burst_flushes_the_last_n_in_order() {
    let factory = Arc::new(FakeTransportFactory::manual_open());
    let client = client_with(&factory, config(QueuePolicy::DropOldest, 3));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    settle().await;

    for id in 1..=4 {
        assert!(client.send(&ping(), json!({"id": id})).await);
    }

    let transport = factory.latest().unwrap();
    transport.emit_open();
    connecting.await.unwrap().unwrap();
    settle().await;

    let ids: Vec<Value> = transport
        .envelopes()
        .iter()
        .map(|envelope| envelope.payload.as_ref().unwrap()["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn immediate_sends_interleave_after_the_flush() {
    let factory = Arc::new(FakeTransportFactory::manual_open());
    let client = client_with(&factory, config(QueuePolicy::DropOldest, 8));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    settle().await;
    assert!(client.send(&ping(), json!({"id": "queued"})).await);

    let transport = factory.latest().unwrap();
    transport.emit_open();
    connecting.await.unwrap().unwrap();

    assert!(client.send(&ping(), json!({"id": "live"})).await);

    let ids: Vec<Value> = transport
        .envelopes()
        .iter()
        .map(|envelope| envelope.payload.as_ref().unwrap()["id"].clone())
        .collect();
    assert_eq!(ids, vec![json!("queued"), json!("live")]);
}

#[tokio::test]
async fn close_clears_the_queue() {
    let factory = Arc::new(FakeTransportFactory::manual_open());
    let client = client_with(&factory, config(QueuePolicy::DropOldest, 8));

    let connecting = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    settle().await;
    assert!(client.send(&ping(), json!({"id": 1})).await);

    client.close().await.unwrap();
    assert_eq!(client.state(), ClientState::Closed);
    let _ = connecting.await.unwrap();

    // Nothing queued survives the close.
    let transport = factory.latest().unwrap();
    assert!(transport.sent().is_empty());
}

#[tokio::test]
async fn open_sends_go_straight_to_the_transport() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = client_with(&factory, config(QueuePolicy::Off, 0));
    client.connect().await.unwrap();

    assert!(client.send(&ping(), json!({"id": 1})).await);
    let transport = factory.latest().unwrap();
    let envelopes = transport.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, "PING");
    assert_eq!(envelopes[0].payload, Some(json!({"id": 1})));
}
