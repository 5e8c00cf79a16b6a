// Anthropic Messages API backend using reqwest + typed SSE events

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::backend::{estimate_request_cost, send_json, ModelPrice};
use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::drift::{
    normalize_system_messages, scale_temperature, truncate_stop_sequences,
    unsupported_feature_warnings, SemanticWarning,
};
use crate::error::ChatError;
use crate::ir::{
    ContentBlock, FinishReason, ImageSource, IrChatRequest, IrChatResponse, IrMessage,
    MessageContent, ResponseMetadata, Role, TokenUsage,
};
use crate::streaming::{ChunkBuilder, StreamingConfig, ToolCallReassembler};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_TEMPERATURE_MAX: f32 = 1.0;
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub base_url: String,
    pub name: String,
    pub default_model: String,
    pub streaming: StreamingConfig,
    pub prices: HashMap<String, ModelPrice>,
}

impl AnthropicConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ANTHROPIC_API_BASE.to_string(),
            name: "anthropic".to_string(),
            default_model: "claude-sonnet-4-20250514".to_string(),
            streaming: StreamingConfig::default(),
            prices: HashMap::new(),
        }
    }
}

pub struct AnthropicBackend {
    client: reqwest::Client,
    config: AnthropicConfig,
    capabilities: CapabilityDescriptor,
}

// ============================== wire types ==============================

#[derive(Debug, Serialize)]
pub struct CreateMessageRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    custom: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Blocks(Vec<WireBlock>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireBlock {
    Text {
        text: String,
    },
    Image {
        source: WireImageSource,
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

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireImageSource {
    #[serde(rename = "type")]
    source_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateMessageResponse {
    #[serde(default)]
    id: Option<String>,
    content: Vec<WireBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

// Streaming event payloads

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageStartBody,
}

#[derive(Debug, Deserialize)]
struct MessageStartBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: WireBlock,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: WireDelta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

// ============================== adapter ==============================

impl AnthropicBackend {
    pub fn new(config: AnthropicConfig) -> Self {
        let mut custom = HashMap::new();
        custom.insert(
            "temperatureScaling".to_string(),
            serde_json::json!("linear 0..=2 mapped onto 0..=1"),
        );
        let capabilities = CapabilityDescriptor {
            streaming: true,
            multi_modal: true,
            tools: true,
            supports_multiple_system_messages: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: false,
            supports_frequency_penalty: false,
            supports_presence_penalty: false,
            max_context_tokens: 200_000,
            max_stop_sequences: 4,
            system_message_strategy: SystemMessageStrategy::SeparateParameter,
            custom,
        };
        Self {
            client: reqwest::Client::new(),
            config,
            capabilities,
        }
    }

    pub fn anthropic(api_key: impl Into<String>) -> Self {
        Self::new(AnthropicConfig::new(api_key))
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.config.base_url)
    }

    pub fn build_request(
        &self,
        request: &IrChatRequest,
        stream: bool,
    ) -> Result<(CreateMessageRequest, Vec<SemanticWarning>), ChatError> {
        request.validate()?;

        let normalized = normalize_system_messages(&request.messages, &self.capabilities);
        let mut warnings = normalized.warnings;
        warnings.extend(unsupported_feature_warnings(request, &self.capabilities));

        let params = &request.parameters;
        let temperature = params.temperature.map(|t| {
            let (scaled, warning) = scale_temperature(t, ANTHROPIC_TEMPERATURE_MAX);
            warnings.extend(warning);
            scaled
        });

        let (stop_sequences, stop_warning) = if params.stop_sequences.is_empty() {
            (None, None)
        } else {
            let (kept, warning) = truncate_stop_sequences(
                &params.stop_sequences,
                self.capabilities.max_stop_sequences,
            );
            (Some(kept), warning)
        };
        warnings.extend(stop_warning);

        let messages = normalized
            .messages
            .iter()
            .map(convert_message)
            .collect::<Result<Vec<_>, _>>()?;

        let wire = CreateMessageRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system: normalized.system_param,
            temperature,
            top_p: params.top_p,
            top_k: params.top_k,
            stop_sequences,
            stream: stream.then_some(true),
            custom: params.custom.clone(),
        };
        Ok((wire, warnings))
    }

    pub fn parse_response(
        &self,
        wire: CreateMessageResponse,
        request: &IrChatRequest,
        latency_ms: u64,
        warnings: Vec<SemanticWarning>,
        raw: Option<serde_json::Value>,
    ) -> Result<IrChatResponse, ChatError> {
        let blocks: Vec<ContentBlock> = wire
            .content
            .into_iter()
            .filter_map(wire_block_to_ir)
            .collect();

        let message = IrMessage {
            role: Role::Assistant,
            content: MessageContent::from_blocks(blocks),
            name: None,
        };

        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.provider_response_id = wire.id;
        metadata.latency_ms = Some(latency_ms);
        metadata.warnings = warnings;

        Ok(IrChatResponse {
            message,
            finish_reason: FinishReason::from_provider(wire.stop_reason.as_deref()),
            usage: wire
                .usage
                .map(|u| TokenUsage::new(u.input_tokens, u.output_tokens)),
            metadata,
            raw,
        })
    }
}

fn wire_block_to_ir(block: WireBlock) -> Option<ContentBlock> {
    match block {
        WireBlock::Text { text } => Some(ContentBlock::Text { text }),
        WireBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse { id, name, input }),
        WireBlock::ToolResult {
            tool_use_id,
            content,
        } => Some(ContentBlock::ToolResult {
            tool_use_id,
            content,
        }),
        WireBlock::Image { .. } => None,
    }
}

fn convert_message(msg: &IrMessage) -> Result<WireMessage, ChatError> {
    let role = match msg.role {
        Role::Assistant => "assistant",
        // Tool results travel as user messages with tool_result blocks
        Role::User | Role::Tool => "user",
        Role::System => {
            return Err(ChatError::adapter_conversion(
                "unexpected_system_message",
                "system messages must be normalized before conversion",
            ));
        }
    };

    let content = match &msg.content {
        MessageContent::Text(text) => WireContent::Text(text.clone()),
        MessageContent::Blocks(blocks) => WireContent::Blocks(
            blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Text { text } => WireBlock::Text { text: text.clone() },
                    ContentBlock::Image { source } => WireBlock::Image {
                        source: match source {
                            ImageSource::Url { url } => WireImageSource {
                                source_type: "url".to_string(),
                                media_type: None,
                                data: None,
                                url: Some(url.clone()),
                            },
                            ImageSource::Base64 { media_type, data } => WireImageSource {
                                source_type: "base64".to_string(),
                                media_type: Some(media_type.clone()),
                                data: Some(data.clone()),
                                url: None,
                            },
                        },
                    },
                    ContentBlock::ToolUse { id, name, input } => WireBlock::ToolUse {
                        id: id.clone(),
                        name: name.clone(),
                        input: input.clone(),
                    },
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                    } => WireBlock::ToolResult {
                        tool_use_id: tool_use_id.clone(),
                        content: content.clone(),
                    },
                })
                .collect(),
        ),
    };

    Ok(WireMessage {
        role: role.to_string(),
        content,
    })
}

#[async_trait::async_trait]
impl BackendAdapter for AnthropicBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        "anthropic"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let (wire, warnings) = self.build_request(request, false)?;
        let started = Instant::now();

        let builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::from(e).with_backend(&self.config.name))?;
        let parsed: CreateMessageResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ChatError::from(e).with_backend(&self.config.name))?;

        let debug = request
            .metadata
            .custom
            .get("debug")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        self.parse_response(
            parsed,
            request,
            started.elapsed().as_millis() as u64,
            warnings,
            debug.then_some(raw),
        )
    }

    async fn execute_stream(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ChatError> {
        let (wire, warnings) = self.build_request(request, true)?;

        let builder = self
            .client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let config = self.config.streaming.for_request(request.stream_mode);
        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.warnings = warnings;
        let backend_name = self.config.name.clone();
        let cancel = cancel.clone();
        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            let mut builder = ChunkBuilder::new(config);
            let mut reassembler = ToolCallReassembler::new();
            let mut stop_reason: Option<String> = None;
            let mut input_tokens = 0u32;
            let mut output_tokens = 0u32;

            yield Ok(builder.start(metadata.clone()));

            futures::pin_mut!(event_stream);
            loop {
                let event_result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        builder.clear();
                        return;
                    }
                    event = event_stream.next() => event,
                };
                let Some(event_result) = event_result else { break };

                let event = match event_result {
                    Ok(event) => event,
                    Err(e) => {
                        log::error!("{} stream error: {}", backend_name, e);
                        yield Ok(builder.error("stream_error", e.to_string()));
                        return;
                    }
                };

                if event.event == "message_stop" {
                    break;
                }
                if event.data.trim().is_empty() {
                    continue;
                }

                match event.event.as_str() {
                    "message_start" => {
                        if let Ok(start) = serde_json::from_str::<MessageStart>(&event.data) {
                            if let Some(id) = start.message.id {
                                metadata.provider_response_id = Some(id);
                            }
                            if let Some(usage) = start.message.usage {
                                input_tokens = usage.input_tokens;
                            }
                        }
                    }
                    "content_block_start" => {
                        if let Ok(start) = serde_json::from_str::<ContentBlockStart>(&event.data) {
                            if let WireBlock::ToolUse { id, name, .. } = start.content_block {
                                reassembler.apply(start.index, Some(id.clone()), Some(name.clone()), None);
                                yield Ok(builder.tool_call_delta(
                                    start.index,
                                    Some(id),
                                    Some(name),
                                    "",
                                ));
                            }
                        }
                    }
                    "content_block_delta" => {
                        if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(&event.data) {
                            match delta.delta {
                                WireDelta::TextDelta { text } => {
                                    yield Ok(builder.content(text));
                                }
                                WireDelta::InputJsonDelta { partial_json } => {
                                    let appended = reassembler.apply(
                                        delta.index,
                                        None,
                                        None,
                                        Some(partial_json),
                                    );
                                    if !appended.is_empty() {
                                        yield Ok(builder.tool_call_delta(
                                            delta.index,
                                            None,
                                            None,
                                            appended,
                                        ));
                                    }
                                }
                                WireDelta::Other => {}
                            }
                        }
                    }
                    "message_delta" => {
                        if let Ok(delta) = serde_json::from_str::<MessageDelta>(&event.data) {
                            if delta.delta.stop_reason.is_some() {
                                stop_reason = delta.delta.stop_reason;
                            }
                            if let Some(usage) = delta.usage {
                                output_tokens = usage.output_tokens;
                            }
                        }
                    }
                    "error" => {
                        if let Ok(err) = serde_json::from_str::<ErrorEvent>(&event.data) {
                            yield Ok(builder.error(err.error.error_type, err.error.message));
                        } else {
                            yield Ok(builder.error("stream_error", event.data.clone()));
                        }
                        return;
                    }
                    // ping and future event types are ignored
                    _ => {}
                }
            }

            let usage = (input_tokens > 0 || output_tokens > 0)
                .then(|| TokenUsage::new(input_tokens, output_tokens));
            if reassembler.is_empty() {
                yield Ok(builder.done_with_text(
                    FinishReason::from_provider(stop_reason.as_deref()),
                    usage,
                    metadata.clone(),
                ));
            } else {
                let text = builder.text().to_string();
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                blocks.extend(std::mem::take(&mut reassembler).finish());
                yield Ok(builder.done(
                    FinishReason::ToolCalls,
                    IrMessage::assistant_blocks(blocks),
                    usage,
                    metadata.clone(),
                ));
            }
        };

        Ok(Box::pin(output))
    }

    async fn health_check(&self) -> bool {
        // A minimal request with an invalid body still proves reachability
        // and authentication; 400 means the credentials were accepted
        self.client
            .post(self.endpoint())
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map(|r| r.status().as_u16() < 500 && r.status().as_u16() != 401)
            .unwrap_or(false)
    }

    fn estimate_cost(&self, request: &IrChatRequest) -> Option<f64> {
        estimate_request_cost(request, &self.config.prices, &self.config.default_model)
    }
}
