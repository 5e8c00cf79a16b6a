use crate::ir::request::Provenance;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Stable error categories shared by every adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    Authorization,
    RateLimit,
    Validation,
    ModelError,
    /// Transport failures; timeouts and cancellations are distinguished by the
    /// error code (`timeout`, `cancelled`)
    Network,
    ServerError,
    AdapterConversion,
    Stream,
    NoAvailableBackend,
    CircuitOpen,
    Unknown,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::Authorization => "authorization",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Validation => "validation",
            ErrorCategory::ModelError => "model_error",
            ErrorCategory::Network => "network",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::AdapterConversion => "adapter_conversion",
            ErrorCategory::Stream => "stream",
            ErrorCategory::NoAvailableBackend => "no_available_backend",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::Unknown => "unknown",
        };
        write!(f, "{}", name)
    }
}

/// The error type carried across the whole pipeline
///
/// Adapters convert provider-native failures into this shape at the boundary;
/// middleware may transform errors but keeps provenance and cause intact.
#[derive(Debug, Error)]
#[error("[{category}/{code}] {message}")]
pub struct ChatError {
    pub category: ErrorCategory,
    /// Stable machine-readable code within the category
    pub code: String,
    pub message: String,
    pub status_code: Option<u16>,
    pub provider_code: Option<String>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub provenance: Provenance,
    pub timestamp: i64,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ChatError {
    pub fn new(
        category: ErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            status_code: None,
            provider_code: None,
            retryable: matches!(
                category,
                ErrorCategory::RateLimit | ErrorCategory::ServerError
            ),
            retry_after: None,
            provenance: Provenance::default(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            cause: None,
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn adapter_conversion(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::AdapterConversion, code, message)
    }

    pub fn network(code: impl Into<String>, message: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorCategory::Network, code, message);
        err.retryable = true;
        err
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::network("timeout", message)
    }

    pub fn cancelled() -> Self {
        let mut err = Self::new(ErrorCategory::Network, "cancelled", "request was cancelled");
        err.retryable = false;
        err
    }

    pub fn stream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Stream, code, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ServerError, "server_error", message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut err = Self::new(ErrorCategory::RateLimit, "rate_limited", message);
        err.retry_after = retry_after;
        err
    }

    pub fn circuit_open(backend: &str) -> Self {
        let mut err = Self::new(
            ErrorCategory::CircuitOpen,
            "circuit_open",
            format!("circuit breaker for backend '{}' is open", backend),
        );
        err.provenance.backend = Some(backend.to_string());
        err
    }

    pub fn no_available_backend(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCategory::NoAvailableBackend,
            "no_available_backend",
            message,
        )
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Unknown, "unknown", message)
    }

    /// Map an HTTP status plus response body onto the taxonomy.
    pub fn from_status(status: u16, body: &str, backend: &str) -> Self {
        let (category, code, retryable) = match status {
            401 => (ErrorCategory::Authentication, "invalid_api_key", false),
            403 => (ErrorCategory::Authorization, "forbidden", false),
            429 => (ErrorCategory::RateLimit, "rate_limited", true),
            400 | 404 | 422 => (ErrorCategory::Validation, "invalid_request", false),
            500..=599 => (ErrorCategory::ServerError, "server_error", true),
            _ => (ErrorCategory::Unknown, "http_error", false),
        };
        let mut err = Self::new(category, code, format!("HTTP {}: {}", status, body));
        err.status_code = Some(status);
        err.retryable = retryable;
        err.provenance.backend = Some(backend.to_string());
        // Providers commonly nest a typed error object in the body
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            let provider_code = value["error"]["code"]
                .as_str()
                .or_else(|| value["error"]["type"].as_str())
                .map(|s| s.to_string());
            err.provider_code = provider_code;
        }
        err
    }

    pub fn with_backend(mut self, backend: &str) -> Self {
        self.provenance.backend = Some(backend.to_string());
        self
    }

    pub fn with_router(mut self, router: &str) -> Self {
        self.provenance.router = Some(router.to_string());
        self
    }

    pub fn with_cause(
        mut self,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.category == ErrorCategory::Network && self.code == "cancelled"
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        let mut chat_err = if err.is_timeout() {
            ChatError::timeout(err.to_string())
        } else {
            ChatError::network("connection", err.to_string())
        };
        chat_err.status_code = err.status().map(|s| s.as_u16());
        chat_err.cause = Some(Box::new(err));
        chat_err
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(err: serde_json::Error) -> Self {
        ChatError::adapter_conversion("json_parse", err.to_string()).with_cause(err)
    }
}

/// Cause type holding every error from an exhausted fallback chain
#[derive(Debug)]
pub struct FailoverAttempts(pub Vec<ChatError>);

impl fmt::Display for FailoverAttempts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed attempts: ", self.0.len())?;
        for (idx, err) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, "; ")?;
            }
            write!(
                f,
                "{}={}",
                err.provenance.backend.as_deref().unwrap_or("?"),
                err
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for FailoverAttempts {}
