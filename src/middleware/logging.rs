use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next, StreamNext};
use crate::adapter::ChunkStream;
use std::time::Instant;

/// Emits one record at request ingress and one at egress.
///
/// Payload logging is off by default so prompts and completions stay out of
/// the logs unless explicitly requested.
#[derive(Debug, Clone, Default)]
pub struct LoggingMiddleware {
    pub include_requests: bool,
    pub include_responses: bool,
}

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verbose() -> Self {
        Self {
            include_requests: true,
            include_responses: true,
        }
    }

    fn log_ingress(&self, request: &IrChatRequest) {
        log::info!(
            "chat request id={} frontend={} model={} messages={}",
            request.metadata.request_id,
            request.metadata.provenance.frontend.as_deref().unwrap_or("-"),
            request.parameters.model.as_deref().unwrap_or("-"),
            request.messages.len(),
        );
        if self.include_requests {
            if let Ok(body) = serde_json::to_string(request) {
                log::debug!("chat request body id={} {}", request.metadata.request_id, body);
            }
        }
    }
}

#[async_trait::async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        let request_id = request.metadata.request_id.clone();
        self.log_ingress(&request);
        let started = Instant::now();

        match next.run(request).await {
            Ok(response) => {
                log::info!(
                    "chat response id={} finish={:?} total_tokens={} latency_ms={}",
                    request_id,
                    response.finish_reason,
                    response
                        .usage
                        .map(|u| u.total_tokens.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    response
                        .metadata
                        .latency_ms
                        .unwrap_or_else(|| started.elapsed().as_millis() as u64),
                );
                if self.include_responses {
                    if let Ok(body) = serde_json::to_string(&response) {
                        log::debug!("chat response body id={} {}", request_id, body);
                    }
                }
                Ok(response)
            }
            Err(err) => {
                log::warn!(
                    "chat error id={} category={} code={} retryable={}",
                    request_id,
                    err.category,
                    err.code,
                    err.retryable,
                );
                Err(err)
            }
        }
    }

    async fn handle_stream(
        &self,
        request: IrChatRequest,
        next: StreamNext<'_>,
    ) -> Result<ChunkStream, ChatError> {
        self.log_ingress(&request);
        next.run(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::CountingBackend;
    use crate::ir::{IrMessage, RequestMetadata};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_logging_passes_through() {
        let backend = CountingBackend::new("hello");
        let middleware: Vec<std::sync::Arc<dyn Middleware>> =
            vec![std::sync::Arc::new(LoggingMiddleware::new())];
        let cancel = CancellationToken::new();
        let next = Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        };

        let request = IrChatRequest::new(
            vec![IrMessage::user("hi")],
            RequestMetadata::stamped("test"),
        );
        let response = next.run(request).await.unwrap();
        assert_eq!(response.message.text(), "hello");
        assert_eq!(backend.call_count(), 1);
    }
}
