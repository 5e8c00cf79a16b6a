use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Short-circuits repeated identical requests within a TTL.
///
/// The key covers only fields that change the completion: model, messages,
/// and the sampling parameters. Metadata, custom passthrough, and provider
/// hints never affect it.
pub struct CachingMiddleware {
    ttl: Duration,
    store: Mutex<HashMap<String, CacheEntry>>,
}

struct CacheEntry {
    stored_at: Instant,
    response: IrChatResponse,
}

impl CachingMiddleware {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Stable hash over the completion-relevant request fields.
    pub fn cache_key(request: &IrChatRequest) -> String {
        let params = &request.parameters;
        let key_fields = serde_json::json!([
            params.model,
            request.messages,
            params.temperature,
            params.top_p,
            params.top_k,
            params.seed,
            params.stop_sequences,
        ]);
        let digest = Sha256::digest(key_fields.to_string().as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }

    fn lookup(&self, key: &str) -> Option<IrChatResponse> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.get(key).and_then(|entry| {
            (entry.stored_at.elapsed() < self.ttl).then(|| entry.response.clone())
        })
    }

    fn insert(&self, key: String, response: &IrChatResponse) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        // drop expired entries opportunistically
        let ttl = self.ttl;
        store.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        store.insert(
            key,
            CacheEntry {
                stored_at: Instant::now(),
                response: response.clone(),
            },
        );
    }
}

#[async_trait::async_trait]
impl Middleware for CachingMiddleware {
    fn name(&self) -> &str {
        "caching"
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        let key = Self::cache_key(&request);

        if let Some(mut cached) = self.lookup(&key) {
            cached.metadata.request_id = request.metadata.request_id.clone();
            cached
                .metadata
                .custom
                .insert("cacheHit".to_string(), serde_json::json!(true));
            return Ok(cached);
        }

        let response = next.run(request).await?;
        self.insert(key, &response);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::testing::CountingBackend;
    use crate::ir::{IrMessage, RequestMetadata};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn request(text: &str) -> IrChatRequest {
        let mut ir = IrChatRequest::new(
            vec![IrMessage::user(text)],
            RequestMetadata::stamped("test"),
        );
        ir.parameters.model = Some("m".to_string());
        ir
    }

    #[test]
    fn test_cache_key_ignores_metadata() {
        let a = request("hi");
        let mut b = request("hi");
        b.metadata
            .custom
            .insert("trace".to_string(), serde_json::json!("xyz"));
        assert_eq!(
            CachingMiddleware::cache_key(&a),
            CachingMiddleware::cache_key(&b)
        );
    }

    #[test]
    fn test_cache_key_varies_on_parameters() {
        let a = request("hi");
        let mut b = request("hi");
        b.parameters.temperature = Some(0.9);
        assert_ne!(
            CachingMiddleware::cache_key(&a),
            CachingMiddleware::cache_key(&b)
        );
    }

    #[tokio::test]
    async fn test_hit_skips_backend_and_marks_response() {
        let backend = CountingBackend::new("cached reply");
        let middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(CachingMiddleware::new(
            Duration::from_secs(60),
        ))];
        let cancel = CancellationToken::new();

        let first = Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(request("hi"))
        .await
        .unwrap();
        assert!(!first.metadata.custom.contains_key("cacheHit"));
        assert_eq!(backend.call_count(), 1);

        let second = Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(request("hi"))
        .await
        .unwrap();
        assert_eq!(second.metadata.custom["cacheHit"], true);
        assert_eq!(second.message.text(), "cached reply");
        // no second backend execution
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_entries_refetch() {
        let backend = CountingBackend::new("reply");
        let middleware: Vec<Arc<dyn Middleware>> = vec![Arc::new(CachingMiddleware::new(
            Duration::from_millis(10),
        ))];
        let cancel = CancellationToken::new();

        Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(request("hi"))
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        Next {
            chain: &middleware,
            backend: &backend,
            cancel: &cancel,
        }
        .run(request("hi"))
        .await
        .unwrap();
        assert_eq!(backend.call_count(), 2);
    }
}
