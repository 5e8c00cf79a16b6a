// Intermediate representation shared by every frontend and backend

pub mod chunk;
pub mod message;
pub mod request;
pub mod response;

pub use chunk::IrStreamChunk;
pub use message::{ContentBlock, ImageSource, IrMessage, MessageContent, Role};
pub use request::{
    IrChatRequest, Parameters, Provenance, RequestMetadata, SchemaMode, SchemaSpec, StreamMode,
};
pub use response::{FinishReason, IrChatResponse, ResponseMetadata, TokenUsage};
