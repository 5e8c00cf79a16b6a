// Gemini generateContent surface: contents/parts in, candidates out

use crate::adapter::{ChunkStream, FrontendAdapter, ProviderStream};
use crate::drift::SemanticWarning;
use crate::error::ChatError;
use crate::ir::{
    ContentBlock, FinishReason, IrChatRequest, IrChatResponse, IrMessage, IrStreamChunk,
    MessageContent, Parameters, RequestMetadata, Role, StreamMode, TokenUsage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller-facing request shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub contents: Vec<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<RequestGenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Extension: per-request emission mode for streamed content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<RequestPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<RequestFunctionCall>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFunctionCall {
    pub name: String,
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RequestGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Caller-facing response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub candidates: Vec<ResponseCandidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage_metadata: Option<ResponseUsage>,
    /// Extension: semantic-drift warnings recorded during translation
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<SemanticWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCandidate {
    pub content: RequestContent,
    pub finish_reason: String,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseUsage {
    pub prompt_token_count: u32,
    pub candidates_token_count: u32,
    pub total_token_count: u32,
}

/// Caller-facing streaming chunk: a partial GenerateResponse
pub type GenerateChunk = GenerateResponse;

#[derive(Debug, Clone, Default)]
pub struct GeminiFrontend;

impl GeminiFrontend {
    pub fn new() -> Self {
        Self
    }
}

fn finish_reason_string(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "STOP",
        FinishReason::Length => "MAX_TOKENS",
        FinishReason::ToolCalls => "TOOL_CALLS",
        FinishReason::ContentFilter => "SAFETY",
        FinishReason::Error => "ERROR",
    }
    .to_string()
}

fn content_to_ir(content: &RequestContent, idx: usize) -> Result<IrMessage, ChatError> {
    let role = match content.role.as_deref() {
        Some("model") => Role::Assistant,
        Some("user") | None => Role::User,
        Some(other) => {
            return Err(ChatError::validation(
                "unknown_role",
                format!("content {} has unknown role '{}'", idx, other),
            ));
        }
    };

    let mut blocks = Vec::new();
    for part in &content.parts {
        if let Some(text) = &part.text {
            blocks.push(ContentBlock::Text { text: text.clone() });
        }
        if let Some(call) = &part.function_call {
            blocks.push(ContentBlock::ToolUse {
                id: format!("call_{}", blocks.len()),
                name: call.name.clone(),
                input: call.args.clone(),
            });
        }
    }

    let message_content = MessageContent::from_blocks(blocks);

    Ok(IrMessage {
        role,
        content: message_content,
        name: None,
    })
}

fn message_to_candidate(message: &IrMessage, finish_reason: FinishReason) -> ResponseCandidate {
    let parts = match &message.content {
        MessageContent::Text(text) => vec![RequestPart {
            text: Some(text.clone()),
            function_call: None,
        }],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(RequestPart {
                    text: Some(text.clone()),
                    function_call: None,
                }),
                ContentBlock::ToolUse { name, input, .. } => Some(RequestPart {
                    text: None,
                    function_call: Some(RequestFunctionCall {
                        name: name.clone(),
                        args: input.clone(),
                    }),
                }),
                _ => None,
            })
            .collect(),
    };
    ResponseCandidate {
        content: RequestContent {
            role: Some("model".to_string()),
            parts,
        },
        finish_reason: finish_reason_string(finish_reason),
        index: 0,
    }
}

impl FrontendAdapter for GeminiFrontend {
    type Request = GenerateRequest;
    type Response = GenerateResponse;
    type Chunk = GenerateChunk;

    fn name(&self) -> &str {
        "gemini-frontend"
    }

    fn provider(&self) -> &str {
        "gemini"
    }

    fn to_ir(&self, request: Self::Request) -> Result<IrChatRequest, ChatError> {
        let mut messages = Vec::with_capacity(request.contents.len() + 1);
        // the surface's systemInstruction becomes a leading system message
        if let Some(instruction) = &request.system_instruction {
            let text: String = instruction
                .parts
                .iter()
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n");
            messages.push(IrMessage::system(text));
        }
        for (idx, content) in request.contents.iter().enumerate() {
            messages.push(content_to_ir(content, idx)?);
        }

        let config = request.generation_config.unwrap_or_default();
        let parameters = Parameters {
            model: request.model,
            temperature: config.temperature,
            max_tokens: config.max_output_tokens,
            top_p: config.top_p,
            top_k: config.top_k,
            frequency_penalty: None,
            presence_penalty: None,
            seed: None,
            stop_sequences: config.stop_sequences.unwrap_or_default(),
            custom: HashMap::new(),
        };

        let ir = IrChatRequest {
            messages,
            parameters,
            stream: request.stream.unwrap_or(false),
            stream_mode: request.stream_mode,
            schema: None,
            metadata: RequestMetadata::stamped(self.name()),
        };
        ir.validate()?;
        Ok(ir)
    }

    fn from_ir(&self, response: &IrChatResponse) -> Result<Self::Response, ChatError> {
        response.validate()?;
        Ok(GenerateResponse {
            candidates: vec![message_to_candidate(
                &response.message,
                response.finish_reason,
            )],
            usage_metadata: response.usage.map(|u| ResponseUsage {
                prompt_token_count: u.prompt_tokens,
                candidates_token_count: u.completion_tokens,
                total_token_count: u.total_tokens,
            }),
            warnings: response.metadata.warnings.clone(),
        })
    }

    fn from_ir_stream(&self, stream: ChunkStream) -> ProviderStream<Self::Chunk> {
        let output = async_stream::stream! {
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                match chunk {
                    // the surface has no dedicated start envelope
                    IrStreamChunk::Start { .. } => {}
                    IrStreamChunk::Content { delta, .. } => {
                        yield Ok(GenerateResponse {
                            candidates: vec![ResponseCandidate {
                                content: RequestContent {
                                    role: Some("model".to_string()),
                                    parts: vec![RequestPart {
                                        text: Some(delta),
                                        function_call: None,
                                    }],
                                },
                                finish_reason: String::new(),
                                index: 0,
                            }],
                            usage_metadata: None,
                            warnings: Vec::new(),
                        });
                    }
                    IrStreamChunk::ToolCallDelta { .. } => {
                        // argument fragments are replayed whole at done
                    }
                    IrStreamChunk::Done { finish_reason, usage, message, .. } => {
                        let mut candidate = message_to_candidate(&message, finish_reason);
                        // the terminal chunk carries only non-text parts plus
                        // the finish reason; text already streamed as deltas
                        candidate.content.parts.retain(|p| p.function_call.is_some());
                        yield Ok(GenerateResponse {
                            candidates: vec![candidate],
                            usage_metadata: usage.map(|u| ResponseUsage {
                                prompt_token_count: u.prompt_tokens,
                                candidates_token_count: u.completion_tokens,
                                total_token_count: u.total_tokens,
                            }),
                            warnings: Vec::new(),
                        });
                    }
                    IrStreamChunk::Error { code, message, .. } => {
                        yield Err(ChatError::stream(code, message));
                        return;
                    }
                }
            }
        };
        Box::pin(output)
    }
}
