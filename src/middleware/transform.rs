use crate::adapter::ChunkStream;
use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next, StreamNext};
use std::sync::Arc;

type TransformFn = Arc<dyn Fn(IrChatRequest) -> IrChatRequest + Send + Sync>;

/// Applies a pure request rewrite before delegating.
pub struct TransformMiddleware {
    name: String,
    transform: TransformFn,
}

impl TransformMiddleware {
    pub fn new<F>(name: impl Into<String>, transform: F) -> Self
    where
        F: Fn(IrChatRequest) -> IrChatRequest + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            transform: Arc::new(transform),
        }
    }
}

#[async_trait::async_trait]
impl Middleware for TransformMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        next.run((self.transform)(request)).await
    }

    async fn handle_stream(
        &self,
        request: IrChatRequest,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, ChatError> {
        next.run((self.transform)(request)).await
    }
}
