// Ollama local backend: JSON-lines streaming with a done-flag terminator

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::backend::send_json;
use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::drift::{
    normalize_system_messages, truncate_stop_sequences, unsupported_feature_warnings,
    SemanticWarning,
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

const OLLAMA_API_BASE: &str = "http://localhost:11434";

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub name: String,
    pub default_model: String,
    pub streaming: StreamingConfig,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: OLLAMA_API_BASE.to_string(),
            name: "ollama".to_string(),
            default_model: "llama3.1".to_string(),
            streaming: StreamingConfig::default(),
        }
    }
}

pub struct OllamaBackend {
    client: reqwest::Client,
    config: OllamaConfig,
    capabilities: CapabilityDescriptor,
}

// ============================== wire types ==============================

#[derive(Debug, Serialize)]
pub struct OllamaChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize, Default)]
pub struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct OllamaChatResponse {
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

// ============================== adapter ==============================

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> Self {
        let capabilities = CapabilityDescriptor {
            streaming: true,
            multi_modal: false,
            tools: false,
            supports_multiple_system_messages: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: true,
            supports_frequency_penalty: false,
            supports_presence_penalty: false,
            max_context_tokens: 32_768,
            max_stop_sequences: 8,
            system_message_strategy: SystemMessageStrategy::InMessages,
            custom: HashMap::new(),
        };
        Self {
            client: reqwest::Client::new(),
            config,
            capabilities,
        }
    }

    pub fn local() -> Self {
        Self::new(OllamaConfig::default())
    }

    fn endpoint(&self) -> String {
        format!("{}/api/chat", self.config.base_url)
    }

    pub fn build_request(
        &self,
        request: &IrChatRequest,
        stream: bool,
    ) -> Result<(OllamaChatRequest, Vec<SemanticWarning>), ChatError> {
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

        let messages = normalized
            .messages
            .iter()
            .map(|msg| WireMessage {
                role: match msg.role {
                    Role::System => "system",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                    Role::User => "user",
                }
                .to_string(),
                content: msg.text(),
            })
            .collect();

        let options = OllamaOptions {
            temperature: params.temperature,
            num_predict: params.max_tokens,
            top_p: params.top_p,
            top_k: params.top_k,
            seed: params.seed,
            stop,
        };

        let wire = OllamaChatRequest {
            model: params
                .model
                .clone()
                .unwrap_or_else(|| self.config.default_model.clone()),
            messages,
            stream,
            options: Some(options),
        };
        Ok((wire, warnings))
    }

    pub fn parse_response(
        &self,
        wire: OllamaChatResponse,
        request: &IrChatRequest,
        latency_ms: u64,
        warnings: Vec<SemanticWarning>,
        raw: Option<serde_json::Value>,
    ) -> Result<IrChatResponse, ChatError> {
        let text = wire
            .message
            .map(|m| m.content)
            .ok_or_else(|| {
                ChatError::adapter_conversion("missing_message", "response carried no message")
                    .with_backend(&self.config.name)
            })?;

        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.config.name);
        metadata.latency_ms = Some(latency_ms);
        metadata.warnings = warnings;

        let usage = match (wire.prompt_eval_count, wire.eval_count) {
            (Some(prompt), Some(completion)) => Some(TokenUsage::new(prompt, completion)),
            _ => None,
        };

        Ok(IrChatResponse {
            message: IrMessage::assistant(text),
            finish_reason: FinishReason::from_provider(wire.done_reason.as_deref()),
            usage,
            metadata,
            raw,
        })
    }
}

#[async_trait::async_trait]
impl BackendAdapter for OllamaBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn provider(&self) -> &str {
        "ollama"
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

        let builder = self.client.post(self.endpoint()).json(&wire);
        let response = send_json(builder, cancel, &self.config.name).await?;

        let raw: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ChatError::from(e).with_backend(&self.config.name))?;
        let parsed: OllamaChatResponse = serde_json::from_value(raw.clone())
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

        let builder = self.client.post(self.endpoint()).json(&wire);
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
            let mut finish_reason: Option<String> = None;
            let mut usage: Option<TokenUsage> = None;

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
                    let chunk = match serde_json::from_str::<OllamaChatResponse>(line) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            yield Ok(builder.error(
                                "chunk_parse",
                                format!("failed to parse line: {}", e),
                            ));
                            return;
                        }
                    };
                    if let Some(message) = &chunk.message {
                        if !message.content.is_empty() {
                            yield Ok(builder.content(message.content.clone()));
                        }
                    }
                    if chunk.done {
                        finish_reason = chunk.done_reason.clone();
                        if let (Some(prompt), Some(completion)) =
                            (chunk.prompt_eval_count, chunk.eval_count)
                        {
                            usage = Some(TokenUsage::new(prompt, completion));
                        }
                        break 'read;
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
            .get(format!("{}/api/tags", self.config.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::RequestMetadata;

    fn backend() -> OllamaBackend {
        OllamaBackend::local()
    }

    fn request(messages: Vec<IrMessage>) -> IrChatRequest {
        IrChatRequest::new(messages, RequestMetadata::stamped("test"))
    }

    #[test]
    fn test_build_request_maps_options() {
        let mut ir = request(vec![IrMessage::system("be brief"), IrMessage::user("hi")]);
        ir.parameters.max_tokens = Some(64);
        ir.parameters.temperature = Some(0.5);
        ir.parameters.seed = Some(3);
        let (wire, warnings) = backend().build_request(&ir, true).unwrap();
        assert!(warnings.is_empty());
        assert!(wire.stream);
        assert_eq!(wire.messages[0].role, "system");
        let options = wire.options.unwrap();
        // max_tokens travels as num_predict
        assert_eq!(options.num_predict, Some(64));
        assert_eq!(options.seed, Some(3));
    }

    #[test]
    fn test_parse_response() {
        let wire: OllamaChatResponse = serde_json::from_value(serde_json::json!({
            "model": "llama3.1",
            "message": { "role": "assistant", "content": "hi there" },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 12,
            "eval_count": 4
        }))
        .unwrap();
        let ir = request(vec![IrMessage::user("hi")]);
        let response = backend()
            .parse_response(wire, &ir, 2, Vec::new(), None)
            .unwrap();
        assert_eq!(response.message.text(), "hi there");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.unwrap().total_tokens, 16);
    }

    #[test]
    fn test_done_flag_parsing() {
        let chunk: OllamaChatResponse = serde_json::from_str(
            r#"{"message":{"role":"assistant","content":"He"},"done":false}"#,
        )
        .unwrap();
        assert!(!chunk.done);

        let chunk: OllamaChatResponse =
            serde_json::from_str(r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop"}"#)
                .unwrap();
        assert!(chunk.done);
        assert_eq!(chunk.done_reason.as_deref(), Some("stop"));
    }
}
