use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use ws_proto::{ErrorCode, WsError};

use crate::context::MessageContext;

/// Boxed future returned by middleware and handlers.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Terminal stage of the pipeline: the registered message handler.
pub trait MessageHandler: Send + Sync {
    fn call(&self, ctx: Arc<MessageContext>) -> BoxFuture<Result<(), WsError>>;
}

/// One pipeline stage. Work may run before and after awaiting
/// `next.run(ctx)`; not invoking `next` at all is a legal
/// short-circuit.
pub trait Middleware: Send + Sync {
    fn handle(&self, ctx: Arc<MessageContext>, next: Next) -> BoxFuture<Result<(), WsError>>;
}

struct FnHandler<F>(F);

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<MessageContext>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WsError>> + Send + 'static,
{
    fn call(&self, ctx: Arc<MessageContext>) -> BoxFuture<Result<(), WsError>> {
        Box::pin((self.0)(ctx))
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<MessageContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WsError>> + Send + 'static,
{
    Arc::new(FnHandler(handler))
}

struct FnMiddleware<F>(F);

impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(Arc<MessageContext>, Next) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), WsError>> + Send + 'static,
{
    fn handle(&self, ctx: Arc<MessageContext>, next: Next) -> BoxFuture<Result<(), WsError>> {
        Box::pin((self.0)(ctx, next))
    }
}

/// Adapts an async closure into a [`Middleware`].
pub fn middleware_fn<F, Fut>(middleware: F) -> Arc<dyn Middleware>
where
    F: Fn(Arc<MessageContext>, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WsError>> + Send + 'static,
{
    Arc::new(FnMiddleware(middleware))
}

/// Continuation handed to each middleware.
///
/// Stages run in order: global middleware in registration order, then
/// per-route middleware in registration order, then the handler. The
/// pipeline tracks the furthest stage entered; a second `run` from the
/// same frame is refused rather than re-entering downstream stages.
pub struct Next {
    stages: Arc<[Arc<dyn Middleware>]>,
    terminal: Arc<dyn MessageHandler>,
    index: usize,
    furthest: Arc<AtomicUsize>,
}

impl Next {
    /// Invokes the rest of the pipeline.
    pub fn run(&self, ctx: Arc<MessageContext>) -> BoxFuture<Result<(), WsError>> {
        let stages = Arc::clone(&self.stages);
        let terminal = Arc::clone(&self.terminal);
        let furthest = Arc::clone(&self.furthest);
        let index = self.index;

        Box::pin(async move {
            let entered = furthest.fetch_max(index + 1, Ordering::SeqCst);
            if entered > index {
                return Err(WsError::with_message(
                    ErrorCode::Internal,
                    "next() called twice from the same middleware",
                ));
            }

            if let Some(stage) = stages.get(index) {
                let next = Next {
                    stages: Arc::clone(&stages),
                    terminal: Arc::clone(&terminal),
                    index: index + 1,
                    furthest,
                };
                stage.handle(ctx, next).await
            } else {
                terminal.call(ctx).await
            }
        })
    }
}

/// Composes the full pipeline for one dispatch and runs it.
pub(crate) fn run_pipeline(
    stages: Arc<[Arc<dyn Middleware>]>,
    terminal: Arc<dyn MessageHandler>,
    ctx: Arc<MessageContext>,
) -> BoxFuture<Result<(), WsError>> {
    let entry = Next {
        stages,
        terminal,
        index: 0,
        furthest: Arc::new(AtomicUsize::new(0)),
    };
    entry.run(ctx)
}
