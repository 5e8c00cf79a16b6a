// OpenAI-shaped backend using reqwest + SSE streaming
//
// The wire shape is shared by a family of hosts (Mistral, Groq, DeepSeek,
// Cerebras, xAI, Perplexity, Azure OpenAI, NVIDIA NIM, LM Studio,
// OpenRouter), so the adapter is parameterized over base URL and label.

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::backend::{estimate_request_cost, send_json, ModelPrice};
use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::drift::{
    normalize_system_messages, truncate_stop_sequences, unsupported_feature_warnings,
    SemanticWarning,
};
use crate::error::ChatError;
use crate::ir::{
    ContentBlock, FinishReason, ImageSource, IrChatRequest, IrChatResponse, IrMessage,
    MessageContent, ResponseMetadata, Role, SchemaMode, TokenUsage,
};
use crate::streaming::{ChunkBuilder, StreamingConfig, ToolCallReassembler};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    /// Registry name for this backend instance
    pub name: String,
    /// Provider label for provenance and logs
    pub provider: String,
    pub default_model: String,
    pub streaming: StreamingConfig,
    pub prices: HashMap<String, ModelPrice>,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: OPENAI_API_BASE.to_string(),
            name: "openai".to_string(),
            provider: "openai".to_string(),
            default_model: "gpt-4o".to_string(),
            streaming: StreamingConfig::default(),
            prices: HashMap::new(),
        }
    }
}

pub struct OpenAiBackend {
    client: reqwest::Client,
    config: OpenAiConfig,
    capabilities: CapabilityDescriptor,
}

// ============================== wire types ==============================

#[derive(Debug, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    #[serde(flatten)]
    custom: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum WireMessage {
    System {
        content: String,
    },
    User {
        content: WireContent,
    },
    Assistant {
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<WireToolCall>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum WireContent {
    Text(String),
    Parts(Vec<WirePart>),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WirePart {
    Text { text: String },
    ImageUrl { image_url: WireImageUrl },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireImageUrl {
    url: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireToolCall {
    id: String,
    #[serde(rename = "type")]
    tool_type: String,
    function: WireFunctionCall,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments
    arguments: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseChoice {
    message: ResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkChoice {
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Debug, Deserialize)]
pub struct ToolCallChunk {
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
pub struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        TokenUsage::new(usage.prompt_tokens, usage.completion_tokens)
    }
}

// ============================== adapter ==============================

impl OpenAiBackend {
    pub fn new(config: OpenAiConfig) -> Self {
        let capabilities = CapabilityDescriptor {
            streaming: true,
            multi_modal: true,
            tools: true,
            supports_multiple_system_messages: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: false,
            supports_seed: true,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_context_tokens: 128_000,
            max_stop_sequences: 4,
            system_message_strategy: SystemMessageStrategy::InMessages,
            custom: HashMap::new(),
        };
        Self {
            client: reqwest::Client::new(),
            config,
            capabilities,
        }
    }

    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new(OpenAiConfig::new(api_key))
    }

    /// Any OpenAI-compatible host: same wire shape, different endpoint.
    pub fn compatible(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        default_model: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let mut config = OpenAiConfig::new(api_key);
        config.base_url = base_url.into();
        config.provider = name.clone();
        config.name = name;
        config.default_model = default_model.into();
        Self::new(config)
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url)
    }

    /// Translate an IR request into the wire shape, collecting drift
    /// warnings along the way.
    pub fn build_request(
        &self,
        request: &IrChatRequest,
        stream: bool,
    ) -> Result<(ChatCompletionRequest, Vec<SemanticWarning>), ChatError> {
        request.validate()?;

        let normalized = normalize_system_messages(&request.messages, &self.capabilities);
        let mut warnings = normalized.warnings;
        warnings.extend(unsupported_feature_warnings(request, &self.capabilities));

        let params = &request.parameters;
        let (stop, stop_warning) = if params.stop_sequences.is_empty() {
            (None, None)
        } else {
            let (kept, warning) = truncate_stop_sequences(
                &params.stop_sequences,
                self.capabilities.max_stop_sequences,
            );
            (Some(kept), warning)
        };
        warnings.extend(stop_warning);

        let mut messages = Vec::with_capacity(normalized.messages.len());
        for msg in &normalized.messages {
            convert_message(msg, &mut messages)?;
        }

        let response_format = request.schema.as_ref().and_then(|spec| match spec.mode {
            SchemaMode::JsonSchema => Some(serde_json::json!({
                "type": "json_schema",
                "json_schema": {
                    "name": spec.name.clone().unwrap_or_else(|| "response".to_string()),
                    "schema": spec.schema,
                },
            })),
            SchemaMode::Json => Some(serde_json::json!({ "type": "json_object" })),
            SchemaMode::Tools | SchemaMode::MdJson => None,
        });

        let wire = ChatCompletionRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            seed: params.seed,
            stop,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
            response_format,
            custom: params.custom.clone(),
        };
        Ok((wire, warnings))
    }

    /// Translate a wire response into the IR, carrying latency and drift.
    pub fn parse_response(
        &self,
        wire: ChatCompletionResponse,
        request: &IrChatRequest,
        latency_ms: u64,
        warnings: Vec<SemanticWarning>,
        raw: Option<serde_json::Value>,
    ) -> Result<IrChatResponse, ChatError> {
        let choice = wire.choices.into_iter().next().ok_or_else(|| {
            ChatError::adapter_conversion("empty_choices", "provider returned no choices")
                .with_backend(&self.config.name)
        })?;

        let mut blocks = Vec::new();
        if let Some(text) = choice.message.content {
            if !text.is_empty() {
                blocks.push(ContentBlock::Text { text });
            }
        }
        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                blocks.push(tool_call_to_block(call));
            }
        }

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
            finish_reason: FinishReason::from_provider(choice.finish_reason.as_deref()),
            usage: wire.usage.map(TokenUsage::from),
            metadata,
            raw,
        })
    }
}

fn tool_call_to_block(call: WireToolCall) -> ContentBlock {
    let input = serde_json::from_str::<serde_json::Value>(&call.function.arguments)
        .unwrap_or_else(|_| serde_json::json!({ "raw": call.function.arguments }));
    ContentBlock::ToolUse {
        id: call.id,
        name: call.function.name,
        input,
    }
}

/// One IR message can expand into several wire messages (tool results).
fn convert_message(msg: &IrMessage, out: &mut Vec<WireMessage>) -> Result<(), ChatError> {
    match msg.role {
        Role::System => out.push(WireMessage::System {
            content: msg.text(),
        }),
        Role::User => match &msg.content {
            MessageContent::Text(text) => out.push(WireMessage::User {
                content: WireContent::Text(text.clone()),
            }),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(WirePart::Text { text: text.clone() })
                        }
                        ContentBlock::Image { source } => parts.push(WirePart::ImageUrl {
                            image_url: WireImageUrl {
                                url: image_url(source),
                            },
                        }),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => out.push(WireMessage::Tool {
                            content: content.clone(),
                            tool_call_id: tool_use_id.clone(),
                        }),
                        ContentBlock::ToolUse { .. } => {
                            return Err(ChatError::adapter_conversion(
                                "tool_use_in_user_message",
                                "tool_use blocks belong to assistant messages",
                            ));
                        }
                    }
                }
                if !parts.is_empty() {
                    out.push(WireMessage::User {
                        content: WireContent::Parts(parts),
                    });
                }
            }
        },
        Role::Assistant => {
            let text = msg.text();
            let tool_calls: Vec<WireToolCall> = msg
                .content
                .tool_uses()
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::ToolUse { id, name, input } => Some(WireToolCall {
                        id: id.clone(),
                        tool_type: "function".to_string(),
                        function: WireFunctionCall {
                            name: name.clone(),
                            arguments: serde_json::to_string(input).unwrap_or_default(),
                        },
                    }),
                    _ => None,
                })
                .collect();
            out.push(WireMessage::Assistant {
                content: (!text.is_empty()).then_some(text),
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            });
        }
        Role::Tool => {
            // Tool messages carry their call id in a tool_result block, or
            // fall back to the message name
            match &msg.content {
                MessageContent::Blocks(blocks) => {
                    for block in blocks {
                        if let ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } = block
                        {
                            out.push(WireMessage::Tool {
                                content: content.clone(),
                                tool_call_id: tool_use_id.clone(),
                            });
                        }
                    }
                }
                MessageContent::Text(text) => out.push(WireMessage::Tool {
                    content: text.clone(),
                    tool_call_id: msg.name.clone().unwrap_or_default(),
                }),
            }
        }
    }
    Ok(())
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data } => {
            format!("data:{};base64,{}", media_type, data)
        }
    }
}

#[async_trait::async_trait]
impl BackendAdapter for OpenAiBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        &self.config.provider
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
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::from(e).with_backend(&self.config.name))?;
        let parsed: ChatCompletionResponse = serde_json::from_value(raw.clone())
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
            .header("Authorization", format!("Bearer {}", self.config.api_key))
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
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;

            yield Ok(builder.start(metadata.clone()));

            futures::pin_mut!(event_stream);
            loop {
                let event_result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        // Dropping the stream releases the reader; clear
                        // accumulators and end without further yields
                        builder.clear();
                        return;
                    }
                    event = event_stream.next() => event,
                };
                let Some(event_result) = event_result else { break };

                match event_result {
                    Ok(event) => {
                        if event.data == "[DONE]" {
                            break;
                        }
                        match serde_json::from_str::<ChatCompletionChunk>(&event.data) {
                            Ok(chunk) => {
                                if let Some(id) = chunk.id {
                                    metadata.provider_response_id.get_or_insert(id);
                                }
                                if let Some(wire_usage) = chunk.usage {
                                    usage = Some(TokenUsage::from(wire_usage));
                                }
                                for choice in chunk.choices {
                                    if let Some(content) = choice.delta.content {
                                        if !content.is_empty() {
                                            yield Ok(builder.content(content));
                                        }
                                    }
                                    if let Some(tool_calls) = choice.delta.tool_calls {
                                        for delta in tool_calls {
                                            let (name, arguments) = match delta.function {
                                                Some(f) => (f.name, f.arguments),
                                                None => (None, None),
                                            };
                                            let appended = reassembler.apply(
                                                delta.index,
                                                delta.id.clone(),
                                                name.clone(),
                                                arguments,
                                            );
                                            if delta.id.is_some()
                                                || name.is_some()
                                                || !appended.is_empty()
                                            {
                                                yield Ok(builder.tool_call_delta(
                                                    delta.index,
                                                    delta.id,
                                                    name,
                                                    appended,
                                                ));
                                            }
                                        }
                                    }
                                    if let Some(reason) = choice.finish_reason {
                                        finish_reason = Some(reason);
                                    }
                                }
                            }
                            Err(e) => {
                                yield Ok(builder.error(
                                    "chunk_parse",
                                    format!("failed to parse chunk: {}", e),
                                ));
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        log::error!("{} stream error: {}", backend_name, e);
                        yield Ok(builder.error("stream_error", e.to_string()));
                        return;
                    }
                }
            }

            let reason = FinishReason::from_provider(finish_reason.as_deref());
            if reassembler.is_empty() {
                yield Ok(builder.done_with_text(reason, usage, metadata.clone()));
            } else {
                let text = builder.text().to_string();
                let mut blocks = Vec::new();
                if !text.is_empty() {
                    blocks.push(ContentBlock::Text { text });
                }
                blocks.extend(std::mem::take(&mut reassembler).finish());
                let message = IrMessage::assistant_blocks(blocks);
                yield Ok(builder.done(
                    FinishReason::ToolCalls,
                    message,
                    usage,
                    metadata.clone(),
                ));
            }
        };

        Ok(Box::pin(output))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!("{}/models", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn estimate_cost(&self, request: &IrChatRequest) -> Option<f64> {
        estimate_request_cost(request, &self.config.prices, &self.config.default_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RequestMetadata;

    fn backend() -> OpenAiBackend {
        OpenAiBackend::openai("test-key")
    }

    fn request(messages: Vec<IrMessage>) -> IrChatRequest {
        IrChatRequest::new(messages, RequestMetadata::stamped("test"))
    }

    #[test]
    fn test_build_request_places_system_in_messages() {
        let ir = request(vec![IrMessage::system("be brief"), IrMessage::user("hi")]);
        let (wire, warnings) = backend().build_request(&ir, false).unwrap();
        assert!(warnings.is_empty());
        assert!(matches!(&wire.messages[0], WireMessage::System { content } if content == "be brief"));
        assert!(matches!(&wire.messages[1], WireMessage::User { .. }));

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][0]["content"], "be brief");
    }

    #[test]
    fn test_build_request_parameters() {
        let mut ir = request(vec![IrMessage::user("hi")]);
        ir.parameters.model = Some("gpt-4o-mini".to_string());
        ir.parameters.temperature = Some(0.3);
        ir.parameters.max_tokens = Some(16);
        ir.parameters.seed = Some(42);
        ir.parameters.stop_sequences = vec!["END".to_string()];

        let (wire, warnings) = backend().build_request(&ir, false).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(wire.model, "gpt-4o-mini");
        assert_eq!(wire.temperature, Some(0.3));
        assert_eq!(wire.max_tokens, Some(16));
        assert_eq!(wire.seed, Some(42));
        assert_eq!(wire.stop.as_deref(), Some(&["END".to_string()][..]));
    }

    #[test]
    fn test_build_request_truncates_stop_sequences() {
        let mut ir = request(vec![IrMessage::user("hi")]);
        ir.parameters.stop_sequences = (0..6).map(|i| format!("s{}", i)).collect();
        let (wire, warnings) = backend().build_request(&ir, false).unwrap();
        assert_eq!(wire.stop.unwrap().len(), 4);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_build_request_custom_passthrough() {
        let mut ir = request(vec![IrMessage::user("hi")]);
        ir.parameters
            .custom
            .insert("logprobs".to_string(), serde_json::json!(true));
        let (wire, _) = backend().build_request(&ir, false).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["logprobs"], true);
    }

    #[test]
    fn test_parse_response_text() {
        let wire: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "id": "chatcmpl-123",
            "choices": [{
                "message": { "content": "hi-back" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 7, "completion_tokens": 3 }
        }))
        .unwrap();
        let ir = request(vec![IrMessage::user("hi")]);
        let response = backend()
            .parse_response(wire, &ir, 12, Vec::new(), None)
            .unwrap();
        assert_eq!(response.message.text(), "hi-back");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.unwrap().total_tokens, 10);
        assert_eq!(
            response.metadata.provider_response_id.as_deref(),
            Some("chatcmpl-123")
        );
        assert_eq!(response.metadata.latency_ms, Some(12));
        assert_eq!(response.metadata.provenance.backend.as_deref(), Some("openai"));
    }

    #[test]
    fn test_parse_response_tool_calls() {
        let wire: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": { "name": "get_weather", "arguments": "{\"city\":\"Tokyo\"}" }
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        }))
        .unwrap();
        let ir = request(vec![IrMessage::user("weather?")]);
        let response = backend()
            .parse_response(wire, &ir, 5, Vec::new(), None)
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::ToolCalls);
        let tool_uses = response.message.content.tool_uses();
        assert_eq!(tool_uses.len(), 1);
        match tool_uses[0] {
            ContentBlock::ToolUse { name, input, .. } => {
                assert_eq!(name, "get_weather");
                assert_eq!(input["city"], "Tokyo");
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_parse_response_unknown_finish_defaults_to_stop() {
        let wire: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "message": { "content": "x" },
                "finish_reason": "made_up_reason"
            }]
        }))
        .unwrap();
        let ir = request(vec![IrMessage::user("hi")]);
        let response = backend()
            .parse_response(wire, &ir, 1, Vec::new(), None)
            .unwrap();
        assert_eq!(response.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_convert_assistant_tool_use() {
        let msg = IrMessage::assistant_blocks(vec![ContentBlock::ToolUse {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            input: serde_json::json!({"q": "x"}),
        }]);
        let mut out = Vec::new();
        convert_message(&msg, &mut out).unwrap();
        match &out[0] {
            WireMessage::Assistant { content, tool_calls } => {
                assert!(content.is_none());
                assert_eq!(tool_calls.as_ref().unwrap()[0].function.name, "lookup");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_convert_tool_result_expands() {
        let msg = IrMessage {
            role: Role::Tool,
            content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                tool_use_id: "call_1".to_string(),
                content: "42".to_string(),
            }]),
            name: Some("lookup".to_string()),
        };
        let mut out = Vec::new();
        convert_message(&msg, &mut out).unwrap();
        assert!(matches!(
            &out[0],
            WireMessage::Tool { tool_call_id, .. } if tool_call_id == "call_1"
        ));
    }

    #[test]
    fn test_image_blocks_become_parts() {
        let msg = IrMessage {
            role: Role::User,
            content: MessageContent::Blocks(vec![
                ContentBlock::Text {
                    text: "what is this".to_string(),
                },
                ContentBlock::Image {
                    source: ImageSource::Base64 {
                        media_type: "image/png".to_string(),
                        data: "aGk=".to_string(),
                    },
                },
            ]),
            name: None,
        };
        let mut out = Vec::new();
        convert_message(&msg, &mut out).unwrap();
        match &out[0] {
            WireMessage::User {
                content: WireContent::Parts(parts),
            } => {
                assert_eq!(parts.len(), 2);
                match &parts[1] {
                    WirePart::ImageUrl { image_url } => {
                        assert_eq!(image_url.url, "data:image/png;base64,aGk=");
                    }
                    other => panic!("unexpected part: {:?}", other),
                }
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_compatible_constructor() {
        let b = OpenAiBackend::compatible(
            "mistral",
            "https://api.mistral.ai/v1",
            "key",
            "mistral-large-latest",
        );
        assert_eq!(b.name(), "mistral");
        assert_eq!(b.endpoint(), "https://api.mistral.ai/v1/chat/completions");
    }

    #[test]
    fn test_chunk_deserialization() {
        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"id":"c1","choices":[{"delta":{"content":"He"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("He"));

        let chunk: ChatCompletionChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"f","arguments":"{\"a\""}}]},"finish_reason":null}]}"#,
        )
        .unwrap();
        let calls = chunk.choices[0].delta.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].index, 0);
        assert_eq!(calls[0].function.as_ref().unwrap().name.as_deref(), Some("f"));
    }
}
