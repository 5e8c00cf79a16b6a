//! End-to-end pipeline: one frontend, an ordered middleware list, and one
//! backend (or a Router standing in for one).

use crate::adapter::{BackendAdapter, ChunkStream, FrontendAdapter, ProviderStream};
use crate::error::ChatError;
use crate::middleware::{Middleware, Next, StreamNext};
use crate::router::PREFERRED_BACKEND_KEY;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
    /// Attach the verbatim provider payload to responses
    pub debug: bool,
    /// Routed requests go to this backend when its breaker allows it
    pub preferred_backend: Option<String>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }
}

/// Aborts the deadline task as soon as the guarded stream ends or is
/// dropped, so the timer never outlives the request it polices.
struct DeadlineTimer(tokio::task::JoinHandle<()>);

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn with_deadline(stream: ChunkStream, timer: tokio::task::JoinHandle<()>) -> ChunkStream {
    let guard = DeadlineTimer(timer);
    Box::pin(async_stream::stream! {
        let _guard = guard;
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            yield item;
        }
    })
}

pub struct Bridge<F: FrontendAdapter> {
    frontend: F,
    backend: Arc<dyn BackendAdapter>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl<F: FrontendAdapter> Bridge<F> {
    pub fn new(frontend: F, backend: Arc<dyn BackendAdapter>) -> Self {
        Self {
            frontend,
            backend,
            middleware: Vec::new(),
        }
    }

    /// Append a middleware. The chain is fixed before the first request, so
    /// every request sees a stable, ordered list.
    pub fn with_middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn frontend(&self) -> &F {
        &self.frontend
    }

    pub fn backend(&self) -> &Arc<dyn BackendAdapter> {
        &self.backend
    }

    pub fn middleware_names(&self) -> Vec<&str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    pub async fn health_check(&self) -> bool {
        self.backend.health_check().await
    }

    fn prepare(
        &self,
        request: F::Request,
        options: &RequestOptions,
    ) -> Result<crate::ir::IrChatRequest, ChatError> {
        let mut ir = self.frontend.to_ir(request)?;
        if options.debug {
            ir.metadata
                .custom
                .insert("debug".to_string(), serde_json::json!(true));
        }
        if let Some(preferred) = &options.preferred_backend {
            ir.metadata.custom.insert(
                PREFERRED_BACKEND_KEY.to_string(),
                serde_json::json!(preferred),
            );
        }
        Ok(ir)
    }

    /// Run the full unary pipeline and shape the result back into the
    /// caller's surface syntax.
    pub async fn chat(
        &self,
        request: F::Request,
        options: &RequestOptions,
    ) -> Result<F::Response, ChatError> {
        let ir = self.prepare(request, options)?;
        let cancel = options.cancel.child_token();
        let next = Next {
            chain: &self.middleware,
            backend: self.backend.as_ref(),
            cancel: &cancel,
        };

        let response = match options.timeout {
            Some(limit) => match tokio::time::timeout(limit, next.run(ir)).await {
                Ok(result) => result?,
                Err(_) => {
                    cancel.cancel();
                    return Err(ChatError::timeout(format!(
                        "request exceeded {:?}",
                        limit
                    )));
                }
            },
            None => next.run(ir).await?,
        };

        self.frontend.from_ir(&response)
    }

    /// Streaming equivalent of `chat`; the innermost handler yields a lazy
    /// chunk sequence that the frontend re-shapes.
    pub async fn chat_stream(
        &self,
        request: F::Request,
        options: &RequestOptions,
    ) -> Result<ProviderStream<F::Chunk>, ChatError> {
        let mut ir = self.prepare(request, options)?;
        ir.stream = true;

        let cancel = options.cancel.child_token();
        let timer = options.timeout.map(|limit| {
            let deadline = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                deadline.cancel();
            })
        });

        let next = StreamNext {
            chain: &self.middleware,
            backend: self.backend.as_ref(),
            cancel: &cancel,
        };
        let stream = match next.run(ir).await {
            Ok(stream) => stream,
            Err(err) => {
                if let Some(timer) = timer {
                    timer.abort();
                }
                return Err(err);
            }
        };
        // the deadline keeps ticking across the stream's life and dies with it
        let stream = match timer {
            Some(timer) => with_deadline(stream, timer),
            None => stream,
        };
        Ok(self.frontend.from_ir_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::TextStreamBackend;
    use crate::frontend::anthropic::{MessagesRequest, RequestContent, RequestMessage};
    use crate::frontend::AnthropicFrontend;
    use crate::ir::{IrChatRequest, IrChatResponse};
    use crate::middleware::{Middleware, Next};
    use futures::StreamExt;
    use std::sync::Mutex;

    fn anthropic_request(text: &str) -> MessagesRequest {
        MessagesRequest {
            system: Some("be brief".to_string()),
            messages: vec![RequestMessage {
                role: "user".to_string(),
                content: RequestContent::Text(text.to_string()),
            }],
            max_tokens: Some(16),
            ..MessagesRequest::default()
        }
    }

    /// Records its name on entry and exit to verify ordering.
    struct OrderProbe {
        name: String,
        trace: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl Middleware for OrderProbe {
        fn name(&self) -> &str {
            &self.name
        }

        async fn handle(
            &self,
            request: IrChatRequest,
            next: Next<'_>,
        ) -> Result<IrChatResponse, ChatError> {
            self.trace.lock().unwrap().push(format!("{}:in", self.name));
            let result = next.run(request).await;
            self.trace
                .lock()
                .unwrap()
                .push(format!("{}:out", self.name));
            result
        }
    }

    /// Short-circuits with a canned response without calling next.
    struct ShortCircuit;

    #[async_trait::async_trait]
    impl Middleware for ShortCircuit {
        fn name(&self) -> &str {
            "short-circuit"
        }

        async fn handle(
            &self,
            request: IrChatRequest,
            _next: Next<'_>,
        ) -> Result<IrChatResponse, ChatError> {
            Ok(IrChatResponse {
                message: crate::ir::IrMessage::assistant("synthetic"),
                finish_reason: crate::ir::FinishReason::Stop,
                usage: None,
                metadata: crate::ir::ResponseMetadata::inherit(&request.metadata, "synthetic"),
                raw: None,
            })
        }
    }

    #[tokio::test]
    async fn test_chat_through_pipeline() {
        let backend = Arc::new(TextStreamBackend::from_deltas("mock", vec!["hi-back"]));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let response = bridge
            .chat(anthropic_request("hi"), &RequestOptions::default())
            .await
            .unwrap();
        assert_eq!(response.stop_reason, "end_turn");
        assert!(matches!(
            &response.content[0],
            crate::frontend::anthropic::ResponseBlock::Text { text } if text == "hi-back"
        ));
    }

    #[tokio::test]
    async fn test_middleware_runs_in_order_and_unwinds_in_reverse() {
        let trace: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let backend = Arc::new(TextStreamBackend::from_deltas("mock", vec!["x"]));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend)
            .with_middleware(OrderProbe {
                name: "first".to_string(),
                trace: trace.clone(),
            })
            .with_middleware(OrderProbe {
                name: "second".to_string(),
                trace: trace.clone(),
            });

        bridge
            .chat(anthropic_request("hi"), &RequestOptions::default())
            .await
            .unwrap();

        let seen = trace.lock().unwrap().clone();
        assert_eq!(seen, vec!["first:in", "second:in", "second:out", "first:out"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_backend() {
        let backend = Arc::new(TextStreamBackend::from_deltas("mock", vec!["unreached"]));
        let bridge =
            Bridge::new(AnthropicFrontend::new(), backend).with_middleware(ShortCircuit);

        let response = bridge
            .chat(anthropic_request("hi"), &RequestOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            &response.content[0],
            crate::frontend::anthropic::ResponseBlock::Text { text } if text == "synthetic"
        ));
    }

    #[tokio::test]
    async fn test_chat_stream_shapes_chunks() {
        let backend = Arc::new(TextStreamBackend::from_deltas(
            "mock",
            vec!["He", "llo", " world"],
        ));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let stream = bridge
            .chat_stream(anthropic_request("hi"), &RequestOptions::default())
            .await
            .unwrap();
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;
        assert!(matches!(
            events.first().unwrap(),
            crate::frontend::anthropic::StreamEvent::MessageStart { .. }
        ));
        assert!(matches!(
            events.last().unwrap(),
            crate::frontend::anthropic::StreamEvent::MessageStop
        ));
    }

    #[tokio::test]
    async fn test_timeout_aborts_unary() {
        let backend = Arc::new(TextStreamBackend::new(
            "slow",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    yield Ok("never".to_string());
                })
            }),
        ));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let err = bridge
            .chat(
                anthropic_request("hi"),
                &RequestOptions::with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "timeout");
        assert_eq!(err.category, crate::error::ErrorCategory::Network);
    }

    #[tokio::test]
    async fn test_timeout_aborts_mid_stream() {
        let backend = Arc::new(TextStreamBackend::new(
            "endless",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    loop {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        yield Ok("tick".to_string());
                    }
                })
            }),
        ));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let stream = bridge
            .chat_stream(
                anthropic_request("hi"),
                &RequestOptions::with_timeout(Duration::from_millis(30)),
            )
            .await
            .unwrap();
        // the deadline fires mid-stream and the producer stops yielding
        let events: Vec<_> = stream.collect().await;
        assert!(events.len() < 20, "deadline never fired: {} events", events.len());
    }

    #[tokio::test]
    async fn test_timeout_does_not_disturb_fast_stream() {
        let backend = Arc::new(TextStreamBackend::from_deltas("mock", vec!["He", "llo"]));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let stream = bridge
            .chat_stream(
                anthropic_request("hi"),
                &RequestOptions::with_timeout(Duration::from_secs(30)),
            )
            .await
            .unwrap();
        let events: Vec<_> = stream.map(|e| e.unwrap()).collect().await;
        assert!(matches!(
            events.last().unwrap(),
            crate::frontend::anthropic::StreamEvent::MessageStop
        ));
    }

    #[tokio::test]
    async fn test_caller_cancellation_propagates() {
        let backend = Arc::new(TextStreamBackend::new(
            "slow",
            Arc::new(|_req| {
                Box::pin(async_stream::stream! {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    yield Ok("never".to_string());
                })
            }),
        ));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend);

        let options = RequestOptions::default();
        let cancel = options.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let err = bridge
            .chat(anthropic_request("hi"), &options)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_middleware_names() {
        let backend = Arc::new(TextStreamBackend::from_deltas("mock", vec!["x"]));
        let bridge = Bridge::new(AnthropicFrontend::new(), backend)
            .with_middleware(crate::middleware::LoggingMiddleware::new())
            .with_middleware(crate::middleware::RetryMiddleware::new(3));
        assert_eq!(bridge.middleware_names(), vec!["logging", "retry"]);
    }
}
