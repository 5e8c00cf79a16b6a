// OpenAI chat-completions surface: callers speak the familiar
// {model, messages, max_tokens} shape and receive choices[] back

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
pub struct ChatCompletionsRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Extension: per-request emission mode for streamed content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopField {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<RequestToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: RequestFunctionCall,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Caller-facing response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponseUsage>,
    /// Extension: semantic-drift warnings recorded during translation
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<SemanticWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<RequestToolCall>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Caller-facing streaming chunk shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionsChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponseUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkToolCall {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub function: ChunkFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkFunction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct OpenAiFrontend;

impl OpenAiFrontend {
    pub fn new() -> Self {
        Self
    }
}

fn finish_reason_string(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
        FinishReason::ToolCalls => "tool_calls",
        FinishReason::ContentFilter => "content_filter",
        FinishReason::Error => "error",
    }
    .to_string()
}

fn usage_out(usage: TokenUsage) -> ResponseUsage {
    ResponseUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
    }
}

fn response_message(message: &IrMessage) -> ResponseMessage {
    let text = message.text();
    let tool_calls: Vec<RequestToolCall> = message
        .content
        .tool_uses()
        .iter()
        .filter_map(|block| match block {
            ContentBlock::ToolUse { id, name, input } => Some(RequestToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: RequestFunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input).unwrap_or_default(),
                },
            }),
            _ => None,
        })
        .collect();
    ResponseMessage {
        role: "assistant".to_string(),
        content: (!text.is_empty()).then_some(text),
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
    }
}

impl FrontendAdapter for OpenAiFrontend {
    type Request = ChatCompletionsRequest;
    type Response = ChatCompletionsResponse;
    type Chunk = ChatCompletionsChunk;

    fn name(&self) -> &str {
        "openai-frontend"
    }

    fn provider(&self) -> &str {
        "openai"
    }

    fn to_ir(&self, request: Self::Request) -> Result<IrChatRequest, ChatError> {
        let mut messages = Vec::with_capacity(request.messages.len());
        for (idx, msg) in request.messages.iter().enumerate() {
            let role = match msg.role.as_str() {
                "system" | "developer" => Role::System,
                "user" => Role::User,
                "assistant" => Role::Assistant,
                "tool" => Role::Tool,
                other => {
                    return Err(ChatError::validation(
                        "unknown_role",
                        format!("message {} has unknown role '{}'", idx, other),
                    ));
                }
            };

            let content = match (role, &msg.tool_calls) {
                (Role::Assistant, Some(calls)) if !calls.is_empty() => {
                    let mut blocks = Vec::new();
                    if let Some(text) = &msg.content {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text { text: text.clone() });
                        }
                    }
                    for call in calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or_else(|_| {
                                serde_json::json!({ "raw": call.function.arguments })
                            });
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                    MessageContent::Blocks(blocks)
                }
                (Role::Tool, _) => MessageContent::Blocks(vec![ContentBlock::ToolResult {
                    tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                    content: msg.content.clone().unwrap_or_default(),
                }]),
                _ => MessageContent::Text(msg.content.clone().unwrap_or_default()),
            };

            messages.push(IrMessage {
                role,
                content,
                name: msg
                    .name
                    .clone()
                    .or_else(|| (role == Role::Tool).then(|| "tool".to_string())),
            });
        }

        let stop_sequences = match request.stop {
            Some(StopField::One(s)) => vec![s],
            Some(StopField::Many(v)) => v,
            None => Vec::new(),
        };

        let parameters = Parameters {
            model: request.model,
            temperature: request.temperature,
            // both spellings of the limit map onto maxTokens
            max_tokens: request.max_tokens.or(request.max_completion_tokens),
            top_p: request.top_p,
            top_k: None,
            frequency_penalty: request.frequency_penalty,
            presence_penalty: request.presence_penalty,
            seed: request.seed,
            stop_sequences,
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
        Ok(ChatCompletionsResponse {
            id: response
                .metadata
                .provider_response_id
                .clone()
                .unwrap_or_else(|| format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())),
            object: "chat.completion".to_string(),
            created: response.metadata.timestamp / 1000,
            model: response
                .metadata
                .provenance
                .backend
                .clone()
                .unwrap_or_default(),
            choices: vec![ResponseChoice {
                index: 0,
                message: response_message(&response.message),
                finish_reason: finish_reason_string(response.finish_reason),
            }],
            usage: response.usage.map(usage_out),
            warnings: response.metadata.warnings.clone(),
        })
    }

    fn from_ir_stream(&self, stream: ChunkStream) -> ProviderStream<Self::Chunk> {
        let output = async_stream::stream! {
            let mut id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());
            let mut model = String::new();
            let mut created = chrono::Utc::now().timestamp();

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
                    IrStreamChunk::Start { metadata, .. } => {
                        if let Some(provider_id) = metadata.provider_response_id {
                            id = provider_id;
                        }
                        model = metadata.provenance.backend.unwrap_or_default();
                        created = metadata.timestamp / 1000;
                        yield Ok(ChatCompletionsChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta {
                                    role: Some("assistant".to_string()),
                                    ..ChunkDelta::default()
                                },
                                finish_reason: None,
                            }],
                            usage: None,
                        });
                    }
                    IrStreamChunk::Content { delta, .. } => {
                        yield Ok(ChatCompletionsChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta {
                                    content: Some(delta),
                                    ..ChunkDelta::default()
                                },
                                finish_reason: None,
                            }],
                            usage: None,
                        });
                    }
                    IrStreamChunk::ToolCallDelta { index, id: call_id, name, arguments_delta, .. } => {
                        yield Ok(ChatCompletionsChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta {
                                    tool_calls: Some(vec![ChunkToolCall {
                                        index,
                                        id: call_id,
                                        function: ChunkFunction {
                                            name,
                                            arguments: arguments_delta,
                                        },
                                    }]),
                                    ..ChunkDelta::default()
                                },
                                finish_reason: None,
                            }],
                            usage: None,
                        });
                    }
                    IrStreamChunk::Done { finish_reason, usage, .. } => {
                        yield Ok(ChatCompletionsChunk {
                            id: id.clone(),
                            object: "chat.completion.chunk".to_string(),
                            created,
                            model: model.clone(),
                            choices: vec![ChunkChoice {
                                index: 0,
                                delta: ChunkDelta::default(),
                                finish_reason: Some(finish_reason_string(finish_reason)),
                            }],
                            usage: usage.map(usage_out),
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
