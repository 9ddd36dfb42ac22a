use super::*;

use async_trait::async_trait;

/// Router + captured socket + manual clock + sink recorder, wired the
/// way an adapter would wire them.
pub(crate) struct TestRig {
    pub(crate) router: Arc<Router>,
    pub(crate) socket: Arc<MemorySocket>,
    pub(crate) clock: Arc<ManualClock>,
    pub(crate) client_id: ClientId,
    pub(crate) errors: Arc<Mutex<Vec<WsError>>>,
}

impl TestRig {
    pub(crate) async fn dispatch(&self, frame: &str) {
        self.router
            .handle_message(&self.client_id, frame.as_bytes())
            .await;
    }

    pub(crate) fn sink_errors(&self) -> Vec<WsError> {
        self.errors.lock().unwrap().clone()
    }
}

pub(crate) async fn rig(routes: RouteTable) -> TestRig {
    rig_with(routes, RouterConfig::default(), |builder| builder).await
}

pub(crate) async fn rig_with(
    routes: RouteTable,
    config: RouterConfig,
    customize: impl FnOnce(RouterBuilder) -> RouterBuilder,
) -> TestRig {
    let clock = Arc::new(ManualClock::new(1_000));
    let builder = Router::builder()
        .config(config)
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .routes(routes);
    let router = Arc::new(customize(builder).build());

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    router.on_error(Arc::new(move |error, _ctx| {
        sink.lock().unwrap().push(error.clone());
    }));

    let socket = Arc::new(MemorySocket::new());
    let client_id = router
        .handle_open(Arc::clone(&socket) as Arc<dyn ServerSocket>)
        .await;

    TestRig {
        router,
        socket,
        clock,
        client_id,
        errors,
    }
}

/// Lets spawned dispatches run up to their next suspension point.
pub(crate) async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Builds a wire frame for dispatch.
pub(crate) fn frame(kind: &str, meta_entries: Value, payload: Option<Value>) -> String {
    let mut envelope = json!({ "type": kind });
    if let Value::Object(entries) = meta_entries {
        if !entries.is_empty() {
            envelope["meta"] = Value::Object(entries);
        }
    }
    if let Some(payload) = payload {
        envelope["payload"] = payload;
    }
    envelope.to_string()
}

/// Event route that records nothing and replies with nothing.
pub(crate) fn noop_route(kind: &str) -> RouteEntry {
    RouteEntry::new(
        MessageDescriptor::event(kind),
        handler_fn(|_ctx| async move { Ok(()) }),
    )
}

/// Event route that appends its type to a shared journal when invoked.
pub(crate) fn recording_route(kind: &str, journal: Arc<Mutex<Vec<String>>>) -> RouteEntry {
    let kind_owned = kind.to_string();
    RouteEntry::new(
        MessageDescriptor::event(kind),
        handler_fn(move |_ctx| {
            let journal = Arc::clone(&journal);
            let kind = kind_owned.clone();
            async move {
                journal.lock().unwrap().push(kind);
                Ok(())
            }
        }),
    )
}

/// Validator that rejects payloads containing a `"bad"` key and
/// otherwise stamps `"validated": true`.
pub(crate) struct StampingValidator;

#[async_trait]
impl Validator for StampingValidator {
    async fn validate(
        &self,
        _descriptor: &MessageDescriptor,
        value: &Value,
    ) -> Result<Value, ValidationIssues> {
        if value.get("bad").is_some() {
            return Err(ValidationIssues::single("bad", "forbidden key"));
        }
        let mut validated = value.clone();
        if let Value::Object(entries) = &mut validated {
            entries.insert("validated".to_string(), Value::Bool(true));
        }
        Ok(validated)
    }
}
