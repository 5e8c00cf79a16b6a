//! chatmux: a provider-agnostic mediation layer for chat-completion APIs.
//!
//! A caller expresses a request in one provider's surface syntax, a
//! [`Bridge`] translates it through a canonical intermediate representation,
//! and any registered backend executes it. Routing policy, fallback, fan-out,
//! streaming normalization, and middleware all operate on the IR, so every
//! frontend/backend pairing composes.
//!
//! ```no_run
//! use chatmux::backend::OpenAiBackend;
//! use chatmux::frontend::anthropic::{MessagesRequest, RequestContent, RequestMessage};
//! use chatmux::frontend::AnthropicFrontend;
//! use chatmux::{Bridge, RequestOptions};
//! use std::sync::Arc;
//!
//! async fn example() -> Result<(), chatmux::ChatError> {
//!     // Anthropic-shaped requests, executed against OpenAI
//!     let bridge = Bridge::new(
//!         AnthropicFrontend::new(),
//!         Arc::new(OpenAiBackend::openai(std::env::var("OPENAI_API_KEY").unwrap())),
//!     );
//!     let response = bridge
//!         .chat(
//!             MessagesRequest {
//!                 system: Some("be brief".to_string()),
//!                 messages: vec![RequestMessage {
//!                     role: "user".to_string(),
//!                     content: RequestContent::Text("hi".to_string()),
//!                 }],
//!                 max_tokens: Some(64),
//!                 ..MessagesRequest::default()
//!             },
//!             &RequestOptions::default(),
//!         )
//!         .await?;
//!     println!("{}", response.stop_reason);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod backend;
pub mod bridge;
pub mod capability;
pub mod drift;
pub mod error;
pub mod frontend;
pub mod ir;
pub mod middleware;
pub mod router;
pub mod streaming;


// Re-export the types most callers touch
pub use adapter::{BackendAdapter, ChunkStream, FrontendAdapter, ProviderStream};
pub use bridge::{Bridge, RequestOptions};
pub use capability::{CapabilityDescriptor, SystemMessageStrategy};
pub use drift::{SemanticWarning, WarningKind};
pub use error::{ChatError, ErrorCategory};
pub use ir::{
    ContentBlock, FinishReason, IrChatRequest, IrChatResponse, IrMessage, IrStreamChunk,
    MessageContent, Parameters, Provenance, RequestMetadata, Role, StreamMode, TokenUsage,
};
pub use middleware::Middleware;
pub use router::{
    BackendStats, BreakerState, FallbackStrategy, FanOutMode, FanOutResult, Router, RouterConfig,
    RoutingStrategy,
};
pub use streaming::{StreamingConfig, ToolCallReassembler};
