// Backend adapters: IR to provider wire protocol, unary and streaming

pub mod anthropic;
pub mod cohere;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod textstream;

pub use anthropic::AnthropicBackend;
pub use cohere::CohereBackend;
pub use gemini::GeminiBackend;
pub use ollama::OllamaBackend;
pub use openai::{OpenAiBackend, OpenAiConfig};
pub use textstream::TextStreamBackend;

use crate::error::ChatError;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Per-model USD pricing used by the default cost estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Default cost heuristic: estimate prompt tokens from message text at
/// 4 chars per token and price them against the model table.
pub(crate) fn estimate_request_cost(
    request: &crate::ir::IrChatRequest,
    prices: &HashMap<String, ModelPrice>,
    default_model: &str,
) -> Option<f64> {
    let model = request
        .parameters
        .model
        .as_deref()
        .unwrap_or(default_model);
    let price = prices.get(model)?;
    let prompt_chars: usize = request.messages.iter().map(|m| m.text().len()).sum();
    let prompt_tokens = (prompt_chars as f64 / 4.0).ceil();
    let completion_tokens = request.parameters.max_tokens.unwrap_or(1024) as f64;
    Some(
        prompt_tokens / 1000.0 * price.input_per_1k
            + completion_tokens / 1000.0 * price.output_per_1k,
    )
}

/// POST a JSON body, racing the send against cancellation, and map non-2xx
/// statuses onto the error taxonomy.
pub(crate) async fn send_json(
    builder: reqwest::RequestBuilder,
    cancel: &CancellationToken,
    backend: &str,
) -> Result<reqwest::Response, ChatError> {
    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(ChatError::cancelled().with_backend(backend)),
        result = builder.send() => result.map_err(|e| ChatError::from(e).with_backend(backend))?,
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "unknown error".to_string());
        return Err(ChatError::from_status(status, &body, backend));
    }
    Ok(response)
}
