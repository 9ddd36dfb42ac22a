use super::*;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

fn manager(config: RpcConfig, clock: &Arc<ManualClock>) -> Arc<RpcManager> {
    RpcManager::new(config, Arc::clone(clock) as Arc<dyn Clock>)
}

fn rpc_route<F, Fut>(handler: F) -> RouteEntry
where
    F: Fn(Arc<MessageContext>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), WsError>> + Send + 'static,
{
    RouteEntry::new(
        MessageDescriptor::rpc("GET_USER", MessageDescriptor::event("USER")),
        handler_fn(handler),
    )
}

#[tokio::test]
async fn exactly_one_terminal_frame_per_correlation() {
    let mut routes = RouteTable::new();
    routes
        .register(rpc_route(|ctx| async move {
            ctx.reply(json!({"id": "u1", "name": "Alice"})).await?;
            ctx.reply(json!({"id": "u1", "name": "Bob"})).await?;
            ctx.error(WsError::new(ErrorCode::Internal));
            Ok(())
        }))
        .unwrap();
    let rig = rig(routes).await;

    rig.dispatch(&frame(
        "GET_USER",
        json!({"correlationId": "r1"}),
        Some(json!({"id": "u1"})),
    ))
    .await;

    let envelopes = rig.socket.envelopes();
    assert_eq!(envelopes.len(), 1, "only the first terminal reaches the wire");
    assert_eq!(envelopes[0].kind, "USER");
    assert_eq!(envelopes[0].correlation_id(), Some("r1"));
    assert_eq!(
        envelopes[0].payload,
        Some(json!({"id": "u1", "name": "Alice"}))
    );
}

#[tokio::test]
async fn error_first_wins_over_reply() {
    let mut routes = RouteTable::new();
    routes
        .register(rpc_route(|ctx| async move {
            ctx.error(WsError::new(ErrorCode::NotFound));
            ctx.reply(json!({"id": "late"})).await
        }))
        .unwrap();
    let rig = rig(routes).await;

    rig.dispatch(&frame("GET_USER", json!({"correlationId": "r1"}), None))
        .await;

    let envelopes = rig.socket.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, RPC_ERROR_TYPE);
    assert_eq!(envelopes[0].correlation_id(), Some("r1"));
}

#[tokio::test]
async fn abort_racing_a_reply_suppresses_the_loser() {
    let gate = Arc::new(Notify::new());
    let cancelled = Arc::new(AtomicBool::new(false));

    let mut routes = RouteTable::new();
    let parked = Arc::clone(&gate);
    let flag = Arc::clone(&cancelled);
    routes
        .register(rpc_route(move |ctx| {
            let gate = Arc::clone(&parked);
            let flag = Arc::clone(&flag);
            async move {
                let observed = Arc::clone(&flag);
                let _registration = ctx.on_cancel(Box::new(move || {
                    observed.store(true, Ordering::SeqCst);
                }));
                gate.notified().await;
                ctx.reply(json!({"id": "u1"})).await
            }
        }))
        .unwrap();
    let rig = rig(routes).await;

    let router = Arc::clone(&rig.router);
    let client_id = rig.client_id.clone();
    let dispatch = tokio::spawn(async move {
        router
            .handle_message(
                &client_id,
                frame("GET_USER", json!({"correlationId": "r1"}), None).as_bytes(),
            )
            .await;
    });
    settle().await;

    // Abort wins the one-shot; the handler's reply is suppressed.
    rig.router.rpc().on_abort(&rig.client_id, "r1");
    assert!(cancelled.load(Ordering::SeqCst));

    gate.notify_one();
    dispatch.await.unwrap();
    assert!(rig.socket.envelopes().is_empty());
}

#[tokio::test]
async fn rpc_without_correlation_id_is_refused() {
    let mut routes = RouteTable::new();
    routes
        .register(rpc_route(|ctx| async move { ctx.reply(json!({})).await }))
        .unwrap();
    let rig = rig(routes).await;

    rig.dispatch(&frame("GET_USER", json!({}), None)).await;

    let envelopes = rig.socket.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, ERROR_TYPE);
    let body = envelopes[0].payload.as_ref().unwrap();
    assert_eq!(body["code"], json!("INVALID_ARGUMENT"));
}

#[tokio::test]
async fn per_socket_inflight_cap_refuses_with_correlated_error() {
    let gate = Arc::new(Notify::new());
    let mut config = RouterConfig::default();
    config.rpc.max_inflight = 1;

    let mut routes = RouteTable::new();
    let parked = Arc::clone(&gate);
    routes
        .register(rpc_route(move |ctx| {
            let gate = Arc::clone(&parked);
            async move {
                gate.notified().await;
                ctx.reply(json!({"id": "u1"})).await
            }
        }))
        .unwrap();
    let rig = rig_with(routes, config, |builder| builder).await;

    let router = Arc::clone(&rig.router);
    let client_id = rig.client_id.clone();
    let first = tokio::spawn(async move {
        router
            .handle_message(
                &client_id,
                frame("GET_USER", json!({"correlationId": "r1"}), None).as_bytes(),
            )
            .await;
    });
    settle().await;

    rig.dispatch(&frame("GET_USER", json!({"correlationId": "r2"}), None))
        .await;

    let refusal = rig.socket.envelopes();
    assert_eq!(refusal.len(), 1);
    assert_eq!(refusal[0].kind, RPC_ERROR_TYPE);
    assert_eq!(refusal[0].correlation_id(), Some("r2"));
    let body = refusal[0].payload.as_ref().unwrap();
    assert_eq!(body["code"], json!("RESOURCE_EXHAUSTED"));

    gate.notify_one();
    first.await.unwrap();
}

#[tokio::test]
async fn disconnect_cancels_every_live_request() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(RpcConfig::default(), &clock);
    let journal = Arc::new(Mutex::new(Vec::new()));

    for correlation_id in ["r1", "r2", "r3"] {
        manager.on_request("c1", correlation_id).unwrap();
        let journal = Arc::clone(&journal);
        let label = correlation_id.to_string();
        manager.on_cancel(
            "c1",
            correlation_id,
            Box::new(move || journal.lock().unwrap().push(label)),
        );
    }
    manager.on_request("c2", "r9").unwrap();

    manager.on_disconnect("c1");

    let mut cancelled = journal.lock().unwrap().clone();
    cancelled.sort();
    assert_eq!(cancelled, vec!["r1", "r2", "r3"]);
    assert_eq!(manager.inflight("c1"), 0);
    assert_eq!(manager.inflight("c2"), 1);
}

#[tokio::test]
async fn cancel_callbacks_fire_in_registration_order_and_abort_is_idempotent() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(RpcConfig::default(), &clock);
    let journal = Arc::new(Mutex::new(Vec::new()));

    manager.on_request("c1", "r1").unwrap();
    for label in ["first", "second", "third"] {
        let journal = Arc::clone(&journal);
        manager.on_cancel("c1", "r1", Box::new(move || {
            journal.lock().unwrap().push(label)
        }));
    }

    manager.on_abort("c1", "r1");
    manager.on_abort("c1", "r1");

    assert_eq!(*journal.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn unregistered_cancel_callbacks_do_not_fire() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(RpcConfig::default(), &clock);
    let journal = Arc::new(Mutex::new(Vec::new()));

    manager.on_request("c1", "r1").unwrap();
    let keep = Arc::clone(&journal);
    manager.on_cancel("c1", "r1", Box::new(move || keep.lock().unwrap().push("keep")));
    let drop_me = Arc::clone(&journal);
    let registration = manager.on_cancel(
        "c1",
        "r1",
        Box::new(move || drop_me.lock().unwrap().push("dropped")),
    );
    registration.unregister();

    manager.on_abort("c1", "r1");
    assert_eq!(*journal.lock().unwrap(), vec!["keep"]);
}

#[tokio::test]
async fn cancel_subscription_on_a_dead_request_fires_immediately() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(RpcConfig::default(), &clock);
    let fired = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&fired);
    manager.on_cancel("c1", "missing", Box::new(move || {
        flag.store(true, Ordering::SeqCst)
    }));
    assert!(fired.load(Ordering::SeqCst));
}

#[tokio::test]
async fn admission_refreshes_an_already_live_correlation() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(
        RpcConfig {
            max_inflight: 1,
            ..RpcConfig::default()
        },
        &clock,
    );

    manager.on_request("c1", "r1").unwrap();
    manager.on_request("c1", "r1").unwrap();
    assert_eq!(manager.inflight("c1"), 1);

    let refused = manager.on_request("c1", "r2").unwrap_err();
    assert_eq!(refused.code, ErrorCode::ResourceExhausted);

    assert!(manager.on_terminal("c1", "r1"));
    manager.on_request("c1", "r2").unwrap();
}

#[tokio::test(start_paused = true)]
async fn idle_sweep_reaps_only_past_the_timeout() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(
        RpcConfig {
            max_inflight: 2048,
            idle_timeout_ms: 1000,
            sweep_interval_ms: 100,
        },
        &clock,
    );
    let cancelled = Arc::new(AtomicBool::new(false));

    manager.on_request("c1", "r1").unwrap();
    let flag = Arc::clone(&cancelled);
    manager.on_cancel("c1", "r1", Box::new(move || {
        flag.store(true, Ordering::SeqCst)
    }));
    manager.start();

    // One millisecond short of the timeout: retained.
    clock.advance(999);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!cancelled.load(Ordering::SeqCst));
    assert_eq!(manager.inflight("c1"), 1);

    // One millisecond past: cancelled and pruned.
    clock.advance(2);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(cancelled.load(Ordering::SeqCst));
    assert_eq!(manager.inflight("c1"), 0);

    manager.stop();
}

#[tokio::test]
async fn progress_on_a_live_request_keeps_it_fresh_for_the_sweep() {
    let clock = Arc::new(ManualClock::new(0));
    let manager = manager(
        RpcConfig {
            max_inflight: 2048,
            idle_timeout_ms: 1000,
            sweep_interval_ms: 100,
        },
        &clock,
    );

    manager.on_request("c1", "r1").unwrap();
    clock.advance(900);
    assert!(manager.on_progress("c1", "r1"));
    clock.advance(900);

    // 1800ms since creation but only 900 since the last progress.
    assert_eq!(manager.request_age("c1", "r1"), Some(1800));
    assert!(manager.on_terminal("c1", "r1"));
    assert!(!manager.on_progress("c1", "r1"), "terminal prunes the state");
}
