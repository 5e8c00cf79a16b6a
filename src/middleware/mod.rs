// Composable wrappers around the IR request/response path
//
// Middleware run in registration order on the way in and unwind in reverse
// on the way out. A middleware that returns without calling `next.run`
// short-circuits the chain; mutating the request means passing a new IR
// value to `next.run`, never editing shared state.

pub mod caching;
pub mod logging;
pub mod rate_limit;
pub mod retry;
pub mod telemetry;
pub mod transform;

pub use caching::CachingMiddleware;
pub use logging::LoggingMiddleware;
pub use rate_limit::RateLimitMiddleware;
pub use retry::RetryMiddleware;
pub use telemetry::TelemetryMiddleware;
pub use transform::TransformMiddleware;

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Continuation handed to each middleware on the unary path
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) backend: &'a dyn BackendAdapter,
    pub(crate) cancel: &'a CancellationToken,
}

impl<'a> Next<'a> {
    pub fn run(self, request: IrChatRequest) -> BoxFuture<'a, Result<IrChatResponse, ChatError>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    head.handle(
                        request,
                        Next {
                            chain: rest,
                            backend: self.backend,
                            cancel: self.cancel,
                        },
                    )
                    .await
                }
                None => self.backend.execute(&request, self.cancel).await,
            }
        })
    }
}

/// Continuation handed to each middleware on the streaming path
#[derive(Clone, Copy)]
pub struct StreamNext<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) backend: &'a dyn BackendAdapter,
    pub(crate) cancel: &'a CancellationToken,
}

impl<'a> StreamNext<'a> {
    pub fn run(self, request: IrChatRequest) -> BoxFuture<'a, Result<ChunkStream, ChatError>> {
        Box::pin(async move {
            match self.chain.split_first() {
                Some((head, rest)) => {
                    head.handle_stream(
                        request,
                        StreamNext {
                            chain: rest,
                            backend: self.backend,
                            cancel: self.cancel,
                        },
                    )
                    .await
                }
                None => self.backend.execute_stream(&request, self.cancel).await,
            }
        })
    }
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError>;

    /// Streaming path; the default just delegates.
    async fn handle_stream(
        &self,
        request: IrChatRequest,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, ChatError> {
        next.run(request).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::backend::TextStreamBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock backend that counts executions and replays a fixed reply.
    pub struct CountingBackend {
        pub inner: TextStreamBackend,
        pub calls: Arc<AtomicUsize>,
    }

    impl CountingBackend {
        pub fn new(reply: &str) -> Self {
            Self {
                inner: TextStreamBackend::from_deltas("counting", vec![reply]),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl BackendAdapter for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn provider(&self) -> &str {
            "mock"
        }

        fn capabilities(&self) -> &crate::capability::CapabilityDescriptor {
            self.inner.capabilities()
        }

        async fn execute(
            &self,
            request: &IrChatRequest,
            cancel: &CancellationToken,
        ) -> Result<IrChatResponse, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(request, cancel).await
        }

        async fn execute_stream(
            &self,
            request: &IrChatRequest,
            cancel: &CancellationToken,
        ) -> Result<ChunkStream, ChatError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute_stream(request, cancel).await
        }
    }
}
