// Anthropic Messages surface: callers speak {system, messages, max_tokens}
// and receive content blocks with a stop_reason back

use crate::adapter::{ChunkStream, FrontendAdapter, ProviderStream};
use crate::drift::SemanticWarning;
use crate::error::ChatError;
use crate::ir::{
    ContentBlock, FinishReason, ImageSource, IrChatRequest, IrChatResponse, IrMessage,
    IrStreamChunk, MessageContent, Parameters, RequestMetadata, Role, StreamMode, TokenUsage,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Caller-facing request shape
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MessagesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<RequestMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    /// Extension: per-request emission mode for streamed content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: String,
    pub content: RequestContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestContent {
    Text(String),
    Blocks(Vec<RequestBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RequestBlock {
    Text {
        text: String,
    },
    Image {
        source: RequestImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Caller-facing response shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub response_type: String,
    pub role: String,
    pub content: Vec<ResponseBlock>,
    pub model: String,
    pub stop_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ResponseUsage>,
    /// Extension: semantic-drift warnings recorded during translation
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub warnings: Vec<SemanticWarning>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResponseUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Caller-facing streaming events, the typed SSE set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: StreamMessageStart,
    },
    ContentBlockStart {
        index: usize,
        content_block: ResponseBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: StreamDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: StreamMessageDelta,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<ResponseUsage>,
    },
    MessageStop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    pub id: String,
    pub role: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageDelta {
    pub stop_reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct AnthropicFrontend;

impl AnthropicFrontend {
    pub fn new() -> Self {
        Self
    }
}

fn stop_reason_string(reason: FinishReason) -> String {
    match reason {
        FinishReason::Stop => "end_turn",
        FinishReason::Length => "max_tokens",
        FinishReason::ToolCalls => "tool_use",
        FinishReason::ContentFilter => "refusal",
        FinishReason::Error => "error",
    }
    .to_string()
}

fn request_block_to_ir(block: &RequestBlock) -> Result<ContentBlock, ChatError> {
    Ok(match block {
        RequestBlock::Text { text } => ContentBlock::Text { text: text.clone() },
        RequestBlock::Image { source } => {
            let ir_source = match source.source_type.as_str() {
                "url" => ImageSource::Url {
                    url: source.url.clone().ok_or_else(|| {
                        ChatError::validation("image_missing_url", "url image without url")
                    })?,
                },
                "base64" => ImageSource::Base64 {
                    media_type: source
                        .media_type
                        .clone()
                        .unwrap_or_else(|| "image/png".to_string()),
                    data: source.data.clone().ok_or_else(|| {
                        ChatError::validation("image_missing_data", "base64 image without data")
                    })?,
                },
                other => {
                    return Err(ChatError::validation(
                        "unknown_image_source",
                        format!("unknown image source type '{}'", other),
                    ));
                }
            };
            ContentBlock::Image { source: ir_source }
        }
        RequestBlock::ToolUse { id, name, input } => ContentBlock::ToolUse {
            id: id.clone(),
            name: name.clone(),
            input: input.clone(),
        },
        RequestBlock::ToolResult {
            tool_use_id,
            content,
        } => ContentBlock::ToolResult {
            tool_use_id: tool_use_id.clone(),
            content: content.clone(),
        },
    })
}

fn response_blocks(message: &IrMessage) -> Vec<ResponseBlock> {
    match &message.content {
        MessageContent::Text(text) => vec![ResponseBlock::Text { text: text.clone() }],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(ResponseBlock::Text { text: text.clone() }),
                ContentBlock::ToolUse { id, name, input } => Some(ResponseBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect(),
    }
}

impl FrontendAdapter for AnthropicFrontend {
    type Request = MessagesRequest;
    type Response = MessagesResponse;
    type Chunk = StreamEvent;

    fn name(&self) -> &str {
        "anthropic-frontend"
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn to_ir(&self, request: Self::Request) -> Result<IrChatRequest, ChatError> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        // the surface's system parameter becomes a leading system message
        if let Some(system) = request.system {
            messages.push(IrMessage::system(system));
        }

        for (idx, msg) in request.messages.iter().enumerate() {
            let role = match msg.role.as_str() {
                "user" => Role::User,
                "assistant" => Role::Assistant,
                other => {
                    return Err(ChatError::validation(
                        "unknown_role",
                        format!("message {} has unknown role '{}'", idx, other),
                    ));
                }
            };
            let content = match &msg.content {
                RequestContent::Text(text) => MessageContent::Text(text.clone()),
                RequestContent::Blocks(blocks) => MessageContent::Blocks(
                    blocks
                        .iter()
                        .map(request_block_to_ir)
                        .collect::<Result<Vec<_>, _>>()?,
                ),
            };
            messages.push(IrMessage {
                role,
                content,
                name: None,
            });
        }

        let parameters = Parameters {
            model: request.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            top_k: request.top_k,
            frequency_penalty: None,
            presence_penalty: None,
            seed: None,
            stop_sequences: request.stop_sequences.unwrap_or_default(),
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
        Ok(MessagesResponse {
            id: response
                .metadata
                .provider_response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            response_type: "message".to_string(),
            role: "assistant".to_string(),
            content: response_blocks(&response.message),
            model: response
                .metadata
                .provenance
                .backend
                .clone()
                .unwrap_or_default(),
            stop_reason: stop_reason_string(response.finish_reason),
            usage: response.usage.map(|u| ResponseUsage {
                input_tokens: u.prompt_tokens,
                output_tokens: u.completion_tokens,
            }),
            warnings: response.metadata.warnings.clone(),
        })
    }

    fn from_ir_stream(&self, stream: ChunkStream) -> ProviderStream<Self::Chunk> {
        let output = async_stream::stream! {
            let mut opened_text_block = false;

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
                        yield Ok(StreamEvent::MessageStart {
                            message: StreamMessageStart {
                                id: metadata
                                    .provider_response_id
                                    .unwrap_or_else(|| format!(
                                        "msg_{}",
                                        uuid::Uuid::new_v4().simple()
                                    )),
                                role: "assistant".to_string(),
                                model: metadata.provenance.backend.unwrap_or_default(),
                            },
                        });
                    }
                    IrStreamChunk::Content { delta, .. } => {
                        if !opened_text_block {
                            opened_text_block = true;
                            yield Ok(StreamEvent::ContentBlockStart {
                                index: 0,
                                content_block: ResponseBlock::Text {
                                    text: String::new(),
                                },
                            });
                        }
                        yield Ok(StreamEvent::ContentBlockDelta {
                            index: 0,
                            delta: StreamDelta::TextDelta { text: delta },
                        });
                    }
                    IrStreamChunk::ToolCallDelta { index, id, name, arguments_delta, .. } => {
                        // tool-call blocks sit after the text block at index 0
                        let block_index = index + 1;
                        if id.is_some() || name.is_some() {
                            yield Ok(StreamEvent::ContentBlockStart {
                                index: block_index,
                                content_block: ResponseBlock::ToolUse {
                                    id: id.unwrap_or_default(),
                                    name: name.unwrap_or_default(),
                                    input: serde_json::json!({}),
                                },
                            });
                        }
                        if !arguments_delta.is_empty() {
                            yield Ok(StreamEvent::ContentBlockDelta {
                                index: block_index,
                                delta: StreamDelta::InputJsonDelta {
                                    partial_json: arguments_delta,
                                },
                            });
                        }
                    }
                    IrStreamChunk::Done { finish_reason, usage, .. } => {
                        if opened_text_block {
                            yield Ok(StreamEvent::ContentBlockStop { index: 0 });
                        }
                        yield Ok(StreamEvent::MessageDelta {
                            delta: StreamMessageDelta {
                                stop_reason: stop_reason_string(finish_reason),
                            },
                            usage: usage.map(|u| ResponseUsage {
                                input_tokens: u.prompt_tokens,
                                output_tokens: u.completion_tokens,
                            }),
                        });
                        yield Ok(StreamEvent::MessageStop);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::ResponseMetadata;

    fn frontend() -> AnthropicFrontend {
        AnthropicFrontend::new()
    }

    #[test]
    fn test_system_parameter_becomes_leading_message() {
        let request = MessagesRequest {
            system: Some("be brief".to_string()),
            messages: vec![RequestMessage {
                role: "user".to_string(),
                content: RequestContent::Text("hi".to_string()),
            }],
            max_tokens: Some(16),
            ..MessagesRequest::default()
        };
        let ir = frontend().to_ir(request).unwrap();
        assert_eq!(ir.messages.len(), 2);
        assert_eq!(ir.messages[0].role, Role::System);
        assert_eq!(ir.messages[0].content.text(), "be brief");
        assert_eq!(ir.parameters.max_tokens, Some(16));
        assert_eq!(
            ir.metadata.provenance.frontend.as_deref(),
            Some("anthropic-frontend")
        );
    }

    #[test]
    fn test_to_ir_blocks() {
        let request = MessagesRequest {
            messages: vec![RequestMessage {
                role: "user".to_string(),
                content: RequestContent::Blocks(vec![
                    RequestBlock::Text {
                        text: "what is this".to_string(),
                    },
                    RequestBlock::Image {
                        source: RequestImageSource {
                            source_type: "base64".to_string(),
                            media_type: Some("image/png".to_string()),
                            data: Some("aGk=".to_string()),
                            url: None,
                        },
                    },
                ]),
            }],
            ..MessagesRequest::default()
        };
        let ir = frontend().to_ir(request).unwrap();
        match &ir.messages[0].content {
            MessageContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[1], ContentBlock::Image { .. }));
            }
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_from_ir_shapes_content_blocks() {
        let response = IrChatResponse {
            message: IrMessage::assistant("hi-back"),
            finish_reason: FinishReason::Stop,
            usage: Some(TokenUsage::new(7, 3)),
            metadata: ResponseMetadata::inherit(
                &RequestMetadata::stamped("anthropic-frontend"),
                "mock",
            ),
            raw: None,
        };
        let out = frontend().from_ir(&response).unwrap();
        assert_eq!(out.stop_reason, "end_turn");
        assert!(matches!(&out.content[0], ResponseBlock::Text { text } if text == "hi-back"));
        let usage = out.usage.unwrap();
        assert_eq!(usage.input_tokens, 7);
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn test_from_ir_surfaces_warnings() {
        use crate::drift::{SemanticWarning, WarningKind};
        let mut metadata =
            ResponseMetadata::inherit(&RequestMetadata::stamped("anthropic-frontend"), "mock");
        metadata.warnings = vec![SemanticWarning::new(
            WarningKind::ParameterScaling,
            "temperature",
            "scaled",
        )];
        let response = IrChatResponse {
            message: IrMessage::assistant("ok"),
            finish_reason: FinishReason::Stop,
            usage: None,
            metadata,
            raw: None,
        };
        let out = frontend().from_ir(&response).unwrap();
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].field, "temperature");
    }

    #[tokio::test]
    async fn test_from_ir_stream_typed_events() {
        use crate::streaming::{ChunkBuilder, StreamingConfig};

        let mut builder = ChunkBuilder::new(StreamingConfig::default());
        let metadata =
            ResponseMetadata::inherit(&RequestMetadata::stamped("anthropic-frontend"), "mock");
        let chunks = vec![
            builder.start(metadata.clone()),
            builder.content("He"),
            builder.content("llo"),
            builder.done_with_text(FinishReason::Stop, None, metadata),
        ];
        let ir_stream: ChunkStream =
            Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));

        let events: Vec<_> = frontend()
            .from_ir_stream(ir_stream)
            .map(|e| e.unwrap())
            .collect()
            .await;

        assert!(matches!(events[0], StreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], StreamEvent::ContentBlockStart { .. }));
        assert!(matches!(
            &events[2],
            StreamEvent::ContentBlockDelta { delta: StreamDelta::TextDelta { text }, .. }
                if text == "He"
        ));
        assert!(matches!(events.last().unwrap(), StreamEvent::MessageStop));
        let has_delta = events.iter().any(|e| {
            matches!(e, StreamEvent::MessageDelta { delta, .. } if delta.stop_reason == "end_turn")
        });
        assert!(has_delta);
    }
}
