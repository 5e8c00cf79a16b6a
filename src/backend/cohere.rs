// Cohere chat backend: JSON-lines streaming with typed event markers

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::backend::{estimate_request_cost, send_json, ModelPrice};
use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::drift::{
    normalize_system_messages, scale_temperature, truncate_stop_sequences,
    unsupported_feature_warnings, SemanticWarning,
};
use crate::error::ChatError;
use crate::ir::{
    FinishReason, IrChatRequest, IrChatResponse, IrMessage, ResponseMetadata, Role, TokenUsage,
};
use crate::streaming::{ChunkBuilder, StreamingConfig};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const COHERE_API_BASE: &str = "https://api.cohere.com/v1";
const COHERE_TEMPERATURE_MAX: f32 = 1.0;

#[derive(Debug, Clone)]
pub struct CohereConfig {
    pub api_key: String,
    pub base_url: String,
    pub name: String,
    pub default_model: String,
    pub streaming: StreamingConfig,
    pub prices: HashMap<String, ModelPrice>,
}

impl CohereConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: COHERE_API_BASE.to_string(),
            name: "cohere".to_string(),
            default_model: "command-r-plus".to_string(),
            streaming: StreamingConfig::default(),
            prices: HashMap::new(),
        }
    }
}

pub struct CohereBackend {
    client: reqwest::Client,
    config: CohereConfig,
    capabilities: CapabilityDescriptor,
}

// ============================== wire types ==============================

#[derive(Debug, Serialize)]
pub struct ChatRequest {
    model: String,
    /// The latest user turn
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    chat_history: Vec<HistoryEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    preamble: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(flatten)]
    custom: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HistoryEntry {
    role: String,
    message: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    generation_id: Option<String>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    meta: Option<ResponseMeta>,
    #[serde(default)]
    citations: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMeta {
    #[serde(default)]
    tokens: Option<TokenCounts>,
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct TokenCounts {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

/// One line of the streaming body
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    event_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    citations: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    response: Option<ChatResponse>,
}

// ============================== adapter ==============================

impl CohereBackend {
    pub fn new(config: CohereConfig) -> Self {
        let mut custom = HashMap::new();
        custom.insert(
            "temperatureScaling".to_string(),
            serde_json::json!("linear 0..=2 mapped onto 0..=1"),
        );
        let capabilities = CapabilityDescriptor {
            streaming: true,
            multi_modal: false,
            tools: false,
            supports_multiple_system_messages: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: false,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_context_tokens: 128_000,
            max_stop_sequences: 5,
            system_message_strategy: SystemMessageStrategy::SeparateParameter,
            custom,
        };
        Self {
            client: reqwest::Client::new(),
            config,
            capabilities,
        }
    }

    pub fn cohere(api_key: impl Into<String>) -> Self {
        Self::new(CohereConfig::new(api_key))
    }

    fn endpoint(&self) -> String {
        format!("{}/chat", self.config.base_url)
    }

    pub fn build_request(
        &self,
        request: &IrChatRequest,
        stream: bool,
    ) -> Result<(ChatRequest, Vec<SemanticWarning>), ChatError> {
        request.validate()?;

        let normalized = normalize_system_messages(&request.messages, &self.capabilities);
        let mut warnings = normalized.warnings;
        warnings.extend(unsupported_feature_warnings(request, &self.capabilities));

        let params = &request.parameters;
        let temperature = params.temperature.map(|t| {
            let (scaled, warning) = scale_temperature(t, COHERE_TEMPERATURE_MAX);
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

        // The trailing user message is the prompt; everything before it is
        // history
        let mut messages = normalized.messages.clone();
        let ends_with_user = messages
            .last()
            .map(|m| m.role == Role::User)
            .unwrap_or(false);
        if !ends_with_user {
            return Err(ChatError::adapter_conversion(
                "missing_user_turn",
                "cohere requests end with a user message",
            )
            .with_backend(&self.config.name));
        }
        let message = messages.pop().map(|m| m.text()).unwrap_or_default();

        let chat_history = messages
            .iter()
            .map(|msg| HistoryEntry {
                role: match msg.role {
                    Role::Assistant => "CHATBOT".to_string(),
                    Role::Tool => "TOOL".to_string(),
                    _ => "USER".to_string(),
                },
                message: msg.text(),
            })
            .collect();

        let wire = ChatRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            message,
            chat_history,
            preamble: normalized.system_param,
            temperature,
            max_tokens: params.max_tokens,
            p: params.top_p,
            k: params.top_k,
            stop_sequences,
            stream: stream.then_some(true),
            custom: params.custom.clone(),
        };
        Ok((wire, warnings))
    }

    pub fn parse_response(
        &self,
        wire: ChatResponse,
        request: &IrChatRequest,
        latency_ms: u64,
        warnings: Vec<SemanticWarning>,
        raw: Option<serde_json::Value>,
    ) -> Result<IrChatResponse, ChatError> {
        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.provider_response_id = wire.generation_id;
        metadata.latency_ms = Some(latency_ms);
        metadata.warnings = warnings;
        if let Some(citations) = wire.citations {
            metadata
                .custom
                .insert("citations".to_string(), serde_json::json!(citations));
        }

        Ok(IrChatResponse {
            message: IrMessage::assistant(wire.text),
            finish_reason: FinishReason::from_provider(wire.finish_reason.as_deref()),
            usage: wire
                .meta
                .and_then(|m| m.tokens)
                .map(|t| TokenUsage::new(t.input_tokens, t.output_tokens)),
            metadata,
            raw,
        })
    }
}

#[async_trait::async_trait]
impl BackendAdapter for CohereBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        "cohere"
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
        let parsed: ChatResponse = serde_json::from_value(raw.clone())
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
        let mut byte_stream = response.bytes_stream();

        let output = async_stream::stream! {
            let mut builder = ChunkBuilder::new(config);
            let mut line_buffer = String::new();
            let mut citations: Vec<serde_json::Value> = Vec::new();
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;
            let mut ended = false;

            yield Ok(builder.start(metadata.clone()));

            'read: loop {
                let frame = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        builder.clear();
                        return;
                    }
                    frame = byte_stream.next() => frame,
                };
                let Some(frame) = frame else { break };

                let bytes: Bytes = match frame {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("{} stream error: {}", backend_name, e);
                        yield Ok(builder.error("stream_error", e.to_string()));
                        return;
                    }
                };
                line_buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = line_buffer.find('\n') {
                    let line: String = line_buffer.drain(..=pos).collect();
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let event = match serde_json::from_str::<StreamEvent>(line) {
                        Ok(event) => event,
                        Err(e) => {
                            yield Ok(builder.error(
                                "chunk_parse",
                                format!("failed to parse line: {}", e),
                            ));
                            return;
                        }
                    };
                    match event.event_type.as_str() {
                        "text-generation" => {
                            if let Some(text) = event.text {
                                if !text.is_empty() {
                                    yield Ok(builder.content(text));
                                }
                            }
                        }
                        "citation-generation" => {
                            if let Some(mut items) = event.citations {
                                citations.append(&mut items);
                            }
                        }
                        "stream-end" => {
                            finish_reason = event.finish_reason.clone();
                            if let Some(response) = event.response {
                                metadata.provider_response_id = response.generation_id;
                                usage = response
                                    .meta
                                    .and_then(|m| m.tokens)
                                    .map(|t| TokenUsage::new(t.input_tokens, t.output_tokens));
                                if let Some(mut items) = response.citations {
                                    citations.append(&mut items);
                                }
                            }
                            ended = true;
                            break 'read;
                        }
                        _ => {}
                    }
                }
            }

            if !ended && finish_reason.is_none() {
                finish_reason = Some("COMPLETE".to_string());
            }
            // Citations arriving around stream-end ride on the done metadata,
            // never as extra content chunks
            if !citations.is_empty() {
                metadata
                    .custom
                    .insert("citations".to_string(), serde_json::json!(citations));
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
