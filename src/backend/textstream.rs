// Wrapper for providers that expose a plain async iterator of text deltas
// (the Chrome on-device style): no envelope, no finish reason, just strings.
// Synthesizes the start chunk and a done chunk at iterator exhaustion.

use crate::adapter::{BackendAdapter, ChunkStream};
use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::error::ChatError;
use crate::ir::{
    FinishReason, IrChatRequest, IrChatResponse, IrMessage, ResponseMetadata, TokenUsage,
};
use crate::streaming::{ChunkBuilder, StreamingConfig};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A provider-native stream of plain text deltas
pub type TextDeltaStream = Pin<Box<dyn Stream<Item = Result<String, ChatError>> + Send>>;

/// Opens a fresh delta stream for one request
pub type TextStreamFactory = Arc<dyn Fn(&IrChatRequest) -> TextDeltaStream + Send + Sync>;

pub struct TextStreamBackend {
    name: String,
    factory: TextStreamFactory,
    streaming: StreamingConfig,
    capabilities: CapabilityDescriptor,
}

impl TextStreamBackend {
    pub fn new(name: impl Into<String>, factory: TextStreamFactory) -> Self {
        let capabilities = CapabilityDescriptor {
            streaming: true,
            multi_modal: false,
            tools: false,
            supports_multiple_system_messages: false,
            supports_temperature: false,
            supports_top_p: false,
            supports_top_k: false,
            supports_seed: false,
            supports_frequency_penalty: false,
            supports_presence_penalty: false,
            max_context_tokens: 8_192,
            max_stop_sequences: 0,
            system_message_strategy: SystemMessageStrategy::PrependUser,
            custom: HashMap::new(),
        };
        Self {
            name: name.into(),
            factory,
            streaming: StreamingConfig::default(),
            capabilities,
        }
    }

    /// Backend that replays a fixed delta script on every request.
    pub fn from_deltas(name: impl Into<String>, deltas: Vec<&str>) -> Self {
        let script: Vec<String> = deltas.into_iter().map(|s| s.to_string()).collect();
        Self::new(
            name,
            Arc::new(move |_request| {
                let script = script.clone();
                Box::pin(futures::stream::iter(script.into_iter().map(Ok)))
            }),
        )
    }

    pub fn with_streaming(mut self, streaming: StreamingConfig) -> Self {
        self.streaming = streaming;
        self
    }
}

#[async_trait::async_trait]
impl BackendAdapter for TextStreamBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provider(&self) -> &str {
        "text-stream"
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    async fn execute(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<IrChatResponse, ChatError> {
        let started = std::time::Instant::now();
        let mut deltas = (self.factory)(request);
        let mut text = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ChatError::cancelled().with_backend(&self.name));
                }
                next = deltas.next() => next,
            };
            match next {
                Some(Ok(delta)) => text.push_str(&delta),
                Some(Err(err)) => return Err(err.with_backend(&self.name)),
                None => break,
            }
        }

        let mut metadata = ResponseMetadata::inherit(&request.metadata, &self.name);
        metadata.latency_ms = Some(started.elapsed().as_millis() as u64);

        let prompt_tokens: u32 = request
            .messages
            .iter()
            .map(|m| crate::adapter::estimate_tokens(&m.text()))
            .sum();
        let completion_tokens = crate::adapter::estimate_tokens(&text);

        Ok(IrChatResponse {
            message: IrMessage::assistant(text),
            finish_reason: FinishReason::Stop,
            usage: Some(TokenUsage::new(prompt_tokens, completion_tokens)),
            metadata,
            raw: None,
        })
    }

    async fn execute_stream(
        &self,
        request: &IrChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChunkStream, ChatError> {
        let config = self.streaming.for_request(request.stream_mode);
        let metadata = ResponseMetadata::inherit(&request.metadata, &self.name);
        let mut deltas = (self.factory)(request);
        let cancel = cancel.clone();

        let output = async_stream::stream! {
            let mut builder = ChunkBuilder::new(config);
            yield Ok(builder.start(metadata.clone()));

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        builder.clear();
                        return;
                    }
                    next = deltas.next() => next,
                };
                match next {
                    Some(Ok(delta)) => {
                        if !delta.is_empty() {
                            yield Ok(builder.content(delta));
                        }
                    }
                    Some(Err(err)) => {
                        yield Ok(builder.error(err.code.clone(), err.message.clone()));
                        return;
                    }
                    None => break,
                }
            }

            yield Ok(builder.done_with_text(FinishReason::Stop, None, metadata.clone()));
        };

        Ok(Box::pin(output))
    }
}
