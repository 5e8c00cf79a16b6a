// Gemini generateContent backend using reqwest + SSE streaming

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
use crate::streaming::{ChunkBuilder, StreamingConfig};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_TEMPERATURE_MAX: f32 = 2.0;

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub name: String,
    pub default_model: String,
    pub streaming: StreamingConfig,
    pub prices: HashMap<String, ModelPrice>,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: GEMINI_API_BASE.to_string(),
            name: "gemini".to_string(),
            default_model: "gemini-2.0-flash".to_string(),
            streaming: StreamingConfig::default(),
            prices: HashMap::new(),
        }
    }
}

pub struct GeminiBackend {
    client: reqwest::Client,
    config: GeminiConfig,
    capabilities: CapabilityDescriptor,
}

// ============================== wire types ==============================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    contents: Vec<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<WireContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct WireContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<WirePart>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct WirePart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FunctionCall {
    name: String,
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

// ============================== adapter ==============================

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> Self {
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
            max_context_tokens: 1_000_000,
            max_stop_sequences: 5,
            system_message_strategy: SystemMessageStrategy::SeparateParameter,
            custom: HashMap::new(),
        };
        Self {
            client: reqwest::Client::new(),
            config,
            capabilities,
        }
    }

    pub fn gemini(api_key: impl Into<String>) -> Self {
        Self::new(GeminiConfig::new(api_key))
    }

    fn model_for(&self, request: &IrChatRequest) -> String {
        request
            .parameters
            .model
            .clone()
            .unwrap_or_else(|| self.config.default_model.clone())
    }

    fn unary_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.config.base_url, model, self.config.api_key
        )
    }

    fn stream_url(&self, model: &str) -> String {
        format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.config.base_url, model, self.config.api_key
        )
    }

    pub fn build_request(
        &self,
        request: &IrChatRequest,
    ) -> Result<(GenerateContentRequest, Vec<SemanticWarning>), ChatError> {
        request.validate()?;

        let normalized = normalize_system_messages(&request.messages, &self.capabilities);
        let mut warnings = normalized.warnings;
        warnings.extend(unsupported_feature_warnings(request, &self.capabilities));

        let params = &request.parameters;
        let temperature = params.temperature.map(|t| {
            let (scaled, warning) = scale_temperature(t, GEMINI_TEMPERATURE_MAX);
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

        let system_instruction = normalized.system_param.map(|text| WireContent {
            role: None,
            parts: vec![WirePart {
                text: Some(text),
                ..WirePart::default()
            }],
        });

        let contents = normalized.messages.iter().map(convert_message).collect();

        let generation_config = Some(GenerationConfig {
            temperature,
            max_output_tokens: params.max_tokens,
            top_p: params.top_p,
            top_k: params.top_k,
            stop_sequences,
        });

        Ok((
            GenerateContentRequest {
                contents,
                system_instruction,
                generation_config,
            },
            warnings,
        ))
    }

    pub fn parse_response(
        &self,
        wire: GenerateContentResponse,
        request: &IrChatRequest,
        latency_ms: u64,
        warnings: Vec<SemanticWarning>,
        raw: Option<serde_json::Value>,
    ) -> Result<IrChatResponse, ChatError> {
        let candidate = wire.candidates.into_iter().next().ok_or_else(|| {
            ChatError::adapter_conversion("empty_candidates", "provider returned no candidates")
                .with_backend(&self.config.name)
        })?;

        let blocks = candidate
            .content
            .map(|content| content_to_blocks(&content))
            .unwrap_or_default();
        let message = IrMessage {
            role: Role::Assistant,
            content: MessageContent::from_blocks(blocks),
            name: None,
        };

        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.provider_response_id = wire.response_id;
        metadata.latency_ms = Some(latency_ms);
        metadata.warnings = warnings;

        Ok(IrChatResponse {
            message,
            finish_reason: FinishReason::from_provider(candidate.finish_reason.as_deref()),
            usage: wire
                .usage_metadata
                .map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count)),
            metadata,
            raw,
        })
    }
}

fn content_to_blocks(content: &WireContent) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    for (idx, part) in content.parts.iter().enumerate() {
        if let Some(text) = &part.text {
            blocks.push(ContentBlock::Text { text: text.clone() });
        }
        if let Some(call) = &part.function_call {
            // Gemini carries no call id; synthesize a stable one
            blocks.push(ContentBlock::ToolUse {
                id: format!("call_{}", idx),
                name: call.name.clone(),
                input: call.args.clone(),
            });
        }
    }
    blocks
}

fn convert_message(msg: &IrMessage) -> WireContent {
    let role = match msg.role {
        Role::Assistant => "model",
        _ => "user",
    };

    let parts = match &msg.content {
        MessageContent::Text(text) => vec![WirePart {
            text: Some(text.clone()),
            ..WirePart::default()
        }],
        MessageContent::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => WirePart {
                    text: Some(text.clone()),
                    ..WirePart::default()
                },
                ContentBlock::Image { source } => match source {
                    ImageSource::Base64 { media_type, data } => WirePart {
                        inline_data: Some(InlineData {
                            mime_type: media_type.clone(),
                            data: data.clone(),
                        }),
                        ..WirePart::default()
                    },
                    // Gemini has no URL image part; pass the URL as text
                    ImageSource::Url { url } => WirePart {
                        text: Some(url.clone()),
                        ..WirePart::default()
                    },
                },
                ContentBlock::ToolUse { name, input, .. } => WirePart {
                    function_call: Some(FunctionCall {
                        name: name.clone(),
                        args: input.clone(),
                    }),
                    ..WirePart::default()
                },
                ContentBlock::ToolResult { content, .. } => WirePart {
                    function_response: Some(FunctionResponse {
                        name: msg.name.clone().unwrap_or_else(|| "tool".to_string()),
                        response: serde_json::from_str(content)
                            .unwrap_or_else(|_| serde_json::json!({ "result": content })),
                    }),
                    ..WirePart::default()
                },
            })
            .collect(),
    };

    WireContent {
        role: Some(role.to_string()),
        parts,
    }
}

#[async_trait::async_trait]
impl BackendAdapter for GeminiBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        "gemini"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let (wire, warnings) = self.build_request(request)?;
        let model = self.model_for(request);
        let started = Instant::now();

        let builder = self.client.post(self.unary_url(&model)).json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::from(e).with_backend(&self.config.name))?;
        let parsed: GenerateContentResponse = serde_json::from_value(raw.clone())
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
        let (wire, warnings) = self.build_request(request)?;
        let model = self.model_for(request);

        let builder = self.client.post(self.stream_url(&model)).json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let config = self.config.streaming.for_request(request.stream_mode);
        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.warnings = warnings;
        let backend_name = self.config.name.clone();
        let cancel = cancel.clone();
        let event_stream = response.bytes_stream().eventsource();

        let output = async_stream::stream! {
            let mut builder = ChunkBuilder::new(config);
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;

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

                match event_result {
                    Ok(event) => {
                        if event.data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<GenerateContentResponse>(&event.data) {
                            Ok(chunk) => {
                                if let Some(id) = chunk.response_id {
                                    metadata.provider_response_id.get_or_insert(id);
                                }
                                if let Some(meta) = chunk.usage_metadata {
                                    usage = Some(TokenUsage::new(
                                        meta.prompt_token_count,
                                        meta.candidates_token_count,
                                    ));
                                }
                                if let Some(candidate) = chunk.candidates.into_iter().next() {
                                    if let Some(content) = candidate.content {
                                        for part in &content.parts {
                                            if let Some(text) = &part.text {
                                                if !text.is_empty() {
                                                    yield Ok(builder.content(text.clone()));
                                                }
                                            }
                                        }
                                    }
                                    if candidate.finish_reason.is_some() {
                                        finish_reason = candidate.finish_reason;
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

            yield Ok(builder.done_with_text(
                FinishReason::from_provider(finish_reason.as_deref()),
                usage,
                metadata.clone(),
            ));
        };

        Ok(Box::pin(output))
    }

    async fn health_check(&self) -> bool {
        self.client
            .get(format!(
                "{}/models?key={}",
                self.config.base_url, self.config.api_key
            ))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn estimate_cost(&self, request: &IrChatRequest) -> Option<f64> {
        estimate_request_cost(request, &self.config.prices, &self.config.default_model)
    }
}
