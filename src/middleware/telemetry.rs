use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

pub type TelemetrySink = Arc<dyn Fn(&str, &HashMap<String, serde_json::Value>) + Send + Sync>;

/// Feeds request/response/error events into a caller-supplied sink.
///
/// Sampling is deterministic per request id, so one request either emits all
/// of its events or none of them.
pub struct TelemetryMiddleware {
    sink: TelemetrySink,
    sample_rate: f64,
}

impl TelemetryMiddleware {
    pub fn new(sink: TelemetrySink) -> Self {
        Self {
            sink,
            sample_rate: 1.0,
        }
    }

    pub fn with_sample_rate(mut self, sample_rate: f64) -> Self {
        self.sample_rate = sample_rate.clamp(0.0, 1.0);
        self
    }

    fn sampled(&self, request_id: &str) -> bool {
        if self.sample_rate >= 1.0 {
            return true;
        }
        if self.sample_rate <= 0.0 {
            return false;
        }
        let mut hasher = DefaultHasher::new();
        request_id.hash(&mut hasher);
        ((hasher.finish() % 10_000) as f64) < self.sample_rate * 10_000.0
    }

    fn emit(&self, event: &str, properties: HashMap<String, serde_json::Value>) {
        (self.sink)(event, &properties);
    }
}

#[async_trait::async_trait]
impl Middleware for TelemetryMiddleware {
    fn name(&self) -> &str {
        "telemetry"
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        let request_id = request.metadata.request_id.clone();
        if !self.sampled(&request_id) {
            return next.run(request).await;
        }

        self.emit(
            "chat.request",
            HashMap::from([
                ("request_id".to_string(), serde_json::json!(request_id)),
                (
                    "model".to_string(),
                    serde_json::json!(request.parameters.model),
                ),
                (
                    "message_count".to_string(),
                    serde_json::json!(request.messages.len()),
                ),
            ]),
        );

        let started = Instant::now();
        match next.run(request).await {
            Ok(response) => {
                self.emit(
                    "chat.response",
                    HashMap::from([
                        ("request_id".to_string(), serde_json::json!(request_id)),
                        (
                            "finish_reason".to_string(),
                            serde_json::json!(response.finish_reason),
                        ),
                        (
                            "latency_ms".to_string(),
                            serde_json::json!(response
                                .metadata
                                .latency_ms
                                .unwrap_or_else(|| started.elapsed().as_millis() as u64)),
                        ),
                        (
                            "total_tokens".to_string(),
                            serde_json::json!(response.usage.map(|u| u.total_tokens)),
                        ),
                    ]),
                );
                Ok(response)
            }
            Err(err) => {
                self.emit(
                    "chat.error",
                    HashMap::from([
                        ("request_id".to_string(), serde_json::json!(request_id)),
                        (
                            "category".to_string(),
                            serde_json::json!(err.category.to_string()),
                        ),
                        ("code".to_string(), serde_json::json!(err.code)),
                    ]),
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::CountingBackend;
    use crate::ir::{IrMessage, RequestMetadata};
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_emits_request_and_response_events() {
        let events: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let sink: TelemetrySink = Arc::new(move |event, _props| {
            sink_events.lock().unwrap().push(event.to_string());
        });

        let backend = CountingBackend::new("ok");
        let middleware: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(TelemetryMiddleware::new(sink))];
        let cancel = CancellationToken::new();
        Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(IrChatRequest::new(
            vec![IrMessage::user("hi")],
            RequestMetadata::stamped("test"),
        ))
        .await
        .unwrap();

        let seen = events.lock().unwrap().clone();
        assert_eq!(seen, vec!["chat.request", "chat.response"]);
    }

    #[test]
    fn test_sampling_is_deterministic() {
        let sink: TelemetrySink = Arc::new(|_, _| {});
        let middleware = TelemetryMiddleware::new(sink).with_sample_rate(0.5);
        let first = middleware.sampled("req_abc");
        for _ in 0..10 {
            assert_eq!(middleware.sampled("req_abc"), first);
        }
        assert!(TelemetryMiddleware::new(Arc::new(|_, _| {}))
            .with_sample_rate(0.0)
            .sampled("x")
            == false);
    }
}
