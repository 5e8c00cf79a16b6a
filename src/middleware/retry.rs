use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse};
use crate::middleware::{Middleware, Next};
use std::sync::Arc;
use std::time::Duration;

type RetryPredicate = Arc<dyn Fn(&ChatError) -> bool + Send + Sync>;

/// Re-runs the rest of the chain on retryable failures with exponential
/// backoff. A provider-supplied retry-after always wins over the computed
/// delay.
pub struct RetryMiddleware {
    max_attempts: u32,
    retry_delay: Duration,
    backoff_multiplier: f64,
    should_retry: Option<RetryPredicate>,
}

impl RetryMiddleware {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            should_retry: None,
        }
    }

    pub fn with_delay(mut self, retry_delay: Duration, backoff_multiplier: f64) -> Self {
        self.retry_delay = retry_delay;
        self.backoff_multiplier = backoff_multiplier;
        self
    }

    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&ChatError) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    fn wants_retry(&self, err: &ChatError) -> bool {
        err.retryable
            && self
                .should_retry
                .as_ref()
                .map(|predicate| predicate(err))
                .unwrap_or(true)
    }

    fn delay_for(&self, attempt: u32, err: &ChatError) -> Duration {
        let backoff = self
            .retry_delay
            .mul_f64(self.backoff_multiplier.powi(attempt as i32));
        match err.retry_after {
            Some(retry_after) => retry_after.max(backoff),
            None => backoff,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for RetryMiddleware {
    fn name(&self) -> &str {
        "retry"
    }

    async fn handle(
        &self,
        request: IrChatRequest,
        next: Next<'_>,
    ) -> Result<IrChatResponse, ChatError> {
        let mut attempt = 0;
        loop {
            match next.run(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || !self.wants_retry(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt - 1, &err);
                    log::debug!(
                        "retrying id={} attempt={} after {:?} ({})",
                        request.metadata.request_id,
                        attempt,
                        delay,
                        err.code,
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
