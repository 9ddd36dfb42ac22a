use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use ws_client::{
    testing::FakeTransportFactory, AbortController, ClientError, RequestOptions, WsClient,
};
use ws_proto::{meta, Envelope, ErrorCode, MessageDescriptor, RPC_ERROR_TYPE, RPC_PROGRESS_TYPE};

fn get_user() -> MessageDescriptor {
    MessageDescriptor::rpc("GET_USER", MessageDescriptor::event("USER"))
}

fn user() -> MessageDescriptor {
    MessageDescriptor::event("USER")
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

async fn connected_client(factory: &Arc<FakeTransportFactory>) -> WsClient {
    let factory = Arc::clone(factory) as Arc<dyn ws_client::ClientTransportFactory>;
    let client = WsClient::builder("wss://example.test/ws", factory).build();
    client.connect().await.unwrap();
    client
}

fn reply_to(sent_frame: &str, response_type: &str, payload: Value) -> Envelope {
    let request: Envelope = serde_json::from_str(sent_frame).unwrap();
    Envelope::new(response_type)
        .with_meta(
            meta::CORRELATION_ID,
            Value::from(request.correlation_id().unwrap()),
        )
        .with_payload(payload)
}

#[tokio::test]
async fn request_resolves_with_the_correlated_reply() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(
                    &get_user(),
                    json!({"id": "u1"}),
                    &user(),
                    RequestOptions::default(),
                )
                .await
        })
    };
    settle().await;

    let sent = transport.sent();
    assert_eq!(sent.len(), 1);
    let request: Envelope = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(request.kind, "GET_USER");
    assert!(request.correlation_id().is_some());
    assert!(request.timeout_ms().is_some());

    transport.emit_envelope(&reply_to(&sent[0], "USER", json!({"id": "u1", "name": "Alice"})));

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome, json!({"id": "u1", "name": "Alice"}));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn request_times_out_with_deadline_exceeded() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;

    let outcome = client
        .request(
            &get_user(),
            json!({"id": "x"}),
            &user(),
            RequestOptions {
                timeout_ms: Some(50),
                ..RequestOptions::default()
            },
        )
        .await;

    match outcome {
        Err(ClientError::DeadlineExceeded { timeout_ms }) => assert_eq!(timeout_ms, 50),
        other => panic!("expected deadline error, got {other:?}"),
    }
    assert_eq!(client.pending_requests(), 0, "the pending map is empty");
}

#[tokio::test]
async fn pre_aborted_requests_never_dispatch() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();

    let controller = AbortController::new();
    controller.abort();

    let outcome = client
        .request(
            &get_user(),
            json!({"id": "x"}),
            &user(),
            RequestOptions {
                signal: Some(controller.signal()),
                ..RequestOptions::default()
            },
        )
        .await;

    assert!(matches!(outcome, Err(ClientError::Cancelled)));
    assert!(transport.sent().is_empty(), "no frame leaves the client");
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn abort_after_dispatch_rejects_and_ignores_the_late_reply() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();
    let controller = AbortController::new();

    let call = {
        let client = client.clone();
        let signal = controller.signal();
        tokio::spawn(async move {
            client
                .request(
                    &get_user(),
                    json!({"id": "u1"}),
                    &user(),
                    RequestOptions {
                        signal: Some(signal),
                        ..RequestOptions::default()
                    },
                )
                .await
        })
    };
    settle().await;
    assert_eq!(client.pending_requests(), 1);

    controller.abort();
    let outcome = call.await.unwrap();
    assert!(matches!(outcome, Err(ClientError::Cancelled)));
    assert_eq!(client.pending_requests(), 0);

    // A reply landing after the reject is dropped silently.
    let sent = transport.sent();
    transport.emit_envelope(&reply_to(&sent[0], "USER", json!({"id": "late"})));
    settle().await;
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test]
async fn rpc_error_envelopes_reject_the_matching_request() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(
                    &get_user(),
                    json!({"id": "nope"}),
                    &user(),
                    RequestOptions::default(),
                )
                .await
        })
    };
    settle().await;

    let sent = transport.sent();
    let error_envelope = reply_to(
        &sent[0],
        RPC_ERROR_TYPE,
        json!({"code": "NOT_FOUND", "message": "no such user", "retryable": false}),
    );
    transport.emit_envelope(&error_envelope);

    let outcome = call.await.unwrap();
    match outcome {
        Err(ClientError::Rpc(body)) => {
            assert_eq!(body.code, ErrorCode::NotFound);
            assert_eq!(body.message, "no such user");
        }
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn progress_frames_reach_the_observer_before_the_reply() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();
    let progress = Arc::new(Mutex::new(Vec::new()));

    let call = {
        let client = client.clone();
        let seen = Arc::clone(&progress);
        tokio::spawn(async move {
            client
                .request(
                    &get_user(),
                    json!({"id": "u1"}),
                    &user(),
                    RequestOptions {
                        on_progress: Some(Arc::new(move |payload| {
                            seen.lock().unwrap().push(payload)
                        })),
                        ..RequestOptions::default()
                    },
                )
                .await
        })
    };
    settle().await;

    let sent = transport.sent();
    transport.emit_envelope(&reply_to(&sent[0], RPC_PROGRESS_TYPE, json!({"pct": 50})));
    transport.emit_envelope(&reply_to(&sent[0], RPC_PROGRESS_TYPE, json!({"pct": 90})));
    transport.emit_envelope(&reply_to(&sent[0], "USER", json!({"id": "u1"})));

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome, json!({"id": "u1"}));
    assert_eq!(
        *progress.lock().unwrap(),
        vec![json!({"pct": 50}), json!({"pct": 90})]
    );
}

#[tokio::test]
async fn duplicate_replies_after_resolution_are_ignored() {
    let factory = Arc::new(FakeTransportFactory::new());
    let client = connected_client(&factory).await;
    let transport = factory.latest().unwrap();

    let call = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .request(&get_user(), json!({}), &user(), RequestOptions::default())
                .await
        })
    };
    settle().await;

    let sent = transport.sent();
    transport.emit_envelope(&reply_to(&sent[0], "USER", json!({"id": "first"})));
    transport.emit_envelope(&reply_to(&sent[0], "USER", json!({"id": "second"})));

    let outcome = call.await.unwrap().unwrap();
    assert_eq!(outcome, json!({"id": "first"}));
    assert_eq!(client.pending_requests(), 0);
}
