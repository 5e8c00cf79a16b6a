use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type KeyGenerator = Arc<dyn Fn(&IrChatRequest) -> String + Send + Sync>;

/// Token-bucket limiter keyed by a caller-supplied function.
///
/// The default key is the frontend name, one bucket per surface; key by
/// model, api key, or tenant by swapping the generator.
pub struct RateLimitMiddleware {
    capacity: f64,
    refill_per_sec: f64,
    key_generator: KeyGenerator,
    buckets: Mutex<HashMap<String, Bucket>>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimitMiddleware {
    /// Allow `requests` per `window`, with bursts up to `requests`.
    pub fn new(requests: u32, window: Duration) -> Self {
        let capacity = requests.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / window.as_secs_f64().max(0.001),
            key_generator: Arc::new(|request| {
                request
                    .metadata
                    .provenance
                    .frontend
                    .clone()
                    .unwrap_or_else(|| "default".to_string())
            }),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_key_generator<F>(mut self, generator: F) -> Self
    where
        F: Fn(&IrChatRequest) -> String + Send + Sync + 'static,
    {
        self.key_generator = Arc::new(generator);
        self
    }

    /// Take one token; on an empty bucket return how long until the next one.
    fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.capacity,
            last_refill: Instant::now(),
        });

        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = Instant::now();

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        let key = (self.key_generator)(&request);
        match self.try_acquire(&key) {
            Ok(()) => next.run(request).await,
            Err(retry_after) => Err(ChatError::rate_limit(
                format!("rate limit exceeded for key '{}'", key),
                Some(retry_after),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::CountingBackend;
    use crate::ir::{IrMessage, RequestMetadata};
    use tokio_util::sync::CancellationToken;

    fn request() -> IrChatRequest {
        IrChatRequest::new(
            vec![IrMessage::user("hi")],
            RequestMetadata::stamped("test"),
        )
    }

    #[tokio::test]
    async fn test_limits_after_capacity() {
        let backend = CountingBackend::new("ok");
        let middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(RateLimitMiddleware::new(
            2,
            Duration::from_secs(3600),
        ))];
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            Next {
                chain: &middleware,
                backend: &backend,
                cancel: &cancel,
            }
            .run(request())
            .await
            .unwrap();
        }
        let err = Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(request())
        .await
        .unwrap_err();

        assert_eq!(err.category, crate::error::ErrorCategory::RateLimit);
        assert!(err.retry_after.is_some());
        assert_eq!(backend.call_count(), 2);
    }

    #[tokio::test]
    async fn test_separate_keys_have_separate_buckets() {
        let backend = CountingBackend::new("ok");
        let middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(
            RateLimitMiddleware::new(1, Duration::from_secs(3600)).with_key_generator(|r| {
                r.parameters.model.clone().unwrap_or_default()
            }),
        )];
        let cancel = CancellationToken::new();

        let mut first = request();
        first.parameters.model = Some("a".to_string());
        let mut second = request();
        second.parameters.model = Some("b".to_string());

        Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(first)
        .await
        .unwrap();
        Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(second)
        .await
        .unwrap();
        assert_eq!(backend.call_count(), 2);
    }
}
