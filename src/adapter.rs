use crate::capability::CapabilityDescriptor;
use crate::error::ChatError;
use crate::ir::{IrChatRequest, IrChatResponse, IrStreamChunk};
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// A lazily produced, finite, non-restartable sequence of IR chunks
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<IrStreamChunk, ChatError>> + Send>>;

/// A stream of provider-shaped values, as produced by frontend shaping
pub type ProviderStream<T> = Pin<Box<dyn Stream<Item = Result<T, ChatError>> + Send>>;

/// Translator between one provider's surface syntax and the IR
///
/// Each adapter fixes its own provider types at compile time; the pipeline
/// stays generic over them.
pub trait FrontendAdapter: Send + Sync {
    type Request;
    type Response;
    type Chunk;

    fn name(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn provider(&self) -> &str;

    /// What the surface syntax can express; used by callers that gate
    /// features before translation. Surfaces are permissive by default.
    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::permissive()
    }

    /// Parse a provider-shaped request into the IR, stamping metadata.
    fn to_ir(&self, request: Self::Request) -> Result<IrChatRequest, ChatError>;

    /// Reconstruct the provider's response shape from an IR response.
    fn from_ir(&self, response: &IrChatResponse) -> Result<Self::Response, ChatError>;

    /// Shape an IR chunk stream into the provider's streaming envelope.
    fn from_ir_stream(&self, stream: ChunkStream) -> ProviderStream<Self::Chunk>;
}

/// Executor of IR requests against one provider's wire protocol
///
/// Object-safe so routers can hold heterogeneous backends; the Router itself
/// implements this trait and slots into a Bridge unchanged.
#[async_trait::async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn provider(&self) -> &str;

    fn capabilities(&self) -> &CapabilityDescriptor;

    /// Perform a unary call. Implementations watch `cancel` and surface
    /// aborts as cancellation errors without leaking the connection.
    async fn execute(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError>;

    /// Open a chunk stream. The producer owns the network reader and
    /// releases it on done, error, cancellation, or consumer drop.
    async fn execute_stream(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ChatError>;

    async fn health_check(&self) -> bool {
        true
    }

    /// Estimated USD cost for the request, when the backend can price it.
    fn estimate_cost(&self, _request: &IrChatRequest) -> Option<f64> {
        None
    }
}

impl std::fmt::Debug for dyn BackendAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendAdapter")
            .field("name", &self.name())
            .field("provider", &self.provider())
            .finish()
    }
}

/// Rough token estimate used by cost heuristics (4 chars per token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("word"), 1);
        assert_eq!(estimate_tokens("Hello world"), 3);
    }
}
