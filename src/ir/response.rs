use crate::drift::SemanticWarning;
use crate::error::ChatError;
use crate::ir::message::{IrMessage, Role};
use crate::ir::request::{Provenance, RequestMetadata};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Why generation stopped
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    /// Map a provider's finish string onto the canonical set, defaulting to
    /// `Stop` for values outside it.
    pub fn from_provider(reason: Option<&str>) -> Self {
        match reason {
            Some("stop") | Some("end_turn") | Some("stop_sequence") | Some("STOP")
            | Some("COMPLETE") => FinishReason::Stop,
            Some("length") | Some("max_tokens") | Some("MAX_TOKENS") => FinishReason::Length,
            Some("tool_calls") | Some("tool_use") | Some("function_call") => {
                FinishReason::ToolCalls
            }
            Some("content_filter") | Some("SAFETY") => FinishReason::ContentFilter,
            Some("error") | Some("ERROR") => FinishReason::Error,
            _ => FinishReason::Stop,
        }
    }
}

/// Token counts for one exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Metadata attached to a response; inherits the request metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub timestamp: i64,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_response_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<SemanticWarning>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

impl ResponseMetadata {
    /// Inherit request metadata, stamping the backend that produced the
    /// response.
    pub fn inherit(request: &RequestMetadata, backend: &str) -> Self {
        let mut provenance = request.provenance.clone();
        provenance.backend = Some(backend.to_string());
        Self {
            request_id: request.request_id.clone(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            provenance,
            provider_response_id: None,
            latency_ms: None,
            warnings: Vec::new(),
            custom: request.custom.clone(),
        }
    }
}

/// The canonical chat response every backend produces
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IrChatResponse {
    pub message: IrMessage,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    pub metadata: ResponseMetadata,
    /// Verbatim provider payload, populated only in debug
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

impl IrChatResponse {
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.message.role != Role::Assistant && self.message.role != Role::Tool {
            return Err(ChatError::adapter_conversion(
                "bad_response_role",
                format!(
                    "response message role must be assistant or tool, got {}",
                    self.message.role
                ),
            ));
        }
        if self.message.content.lacks_substance() {
            return Err(ChatError::adapter_conversion(
                "empty_response_content",
                "response message has neither text nor tool_use blocks",
            ));
        }
        if let Some(usage) = &self.usage {
            if usage.total_tokens != usage.prompt_tokens + usage.completion_tokens {
                return Err(ChatError::adapter_conversion(
                    "usage_mismatch",
                    format!(
                        "total_tokens {} != prompt {} + completion {}",
                        usage.total_tokens, usage.prompt_tokens, usage.completion_tokens
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::message::ContentBlock;

    fn response(message: IrMessage) -> IrChatResponse {
        IrChatResponse {
            message,
            finish_reason: FinishReason::Stop,
            usage: None,
            metadata: ResponseMetadata::inherit(&RequestMetadata::stamped("test"), "mock"),
            raw: None,
        }
    }

    #[test]
    fn test_finish_reason_mapping() {
        assert_eq!(FinishReason::from_provider(Some("end_turn")), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider(Some("max_tokens")), FinishReason::Length);
        assert_eq!(FinishReason::from_provider(Some("tool_use")), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_provider(Some("SAFETY")), FinishReason::ContentFilter);
        // out-of-range values default to Stop
        assert_eq!(FinishReason::from_provider(Some("weird")), FinishReason::Stop);
        assert_eq!(FinishReason::from_provider(None), FinishReason::Stop);
    }

    #[test]
    fn test_usage_arithmetic() {
        let usage = TokenUsage::new(10, 5);
        assert_eq!(usage.total_tokens, 15);

        let mut resp = response(IrMessage::assistant("hi"));
        resp.usage = Some(TokenUsage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 16,
        });
        assert_eq!(resp.validate().unwrap_err().code, "usage_mismatch");
    }

    #[test]
    fn test_empty_content_rejected() {
        let resp = response(IrMessage::assistant(""));
        assert_eq!(resp.validate().unwrap_err().code, "empty_response_content");

        // tool_use-only content is substantive
        let resp = response(IrMessage::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            input: serde_json::json!({}),
        }]));
        assert!(resp.validate().is_ok());
    }

    #[test]
    fn test_metadata_inherits_provenance() {
        let mut request_meta = RequestMetadata::stamped("anthropic-frontend");
        request_meta.provenance.router = Some("router".to_string());
        let meta = ResponseMetadata::inherit(&request_meta, "openai");
        assert_eq!(meta.request_id, request_meta.request_id);
        assert_eq!(meta.provenance.frontend.as_deref(), Some("anthropic-frontend"));
        assert_eq!(meta.provenance.router.as_deref(), Some("router"));
        assert_eq!(meta.provenance.backend.as_deref(), Some("openai"));
    }
}
