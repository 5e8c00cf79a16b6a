use crate::error::ChatError;
use crate::ir::message::{IrMessage, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Emission shape for streamed content chunks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Each chunk carries only the incremental substring
    #[default]
    Delta,
    /// Each chunk carries the full concatenation so far
    Accumulated,
}

/// How structured output should be requested from the provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaMode {
    Tools,
    JsonSchema,
    Json,
    MdJson,
}

/// Structured-output descriptor carried through the pipeline untouched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaSpec {
    pub schema: serde_json::Value,
    pub mode: SchemaMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Recognized generation options
///
/// Every field is optional; an all-default value means the caller supplied
/// nothing. Provider-specific escape hatches live in `custom` and are never
/// parsed by the core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Parameters {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

/// Trace stamps naming the adapters that handled a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Provenance {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
}

/// Metadata attached to every request on entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestMetadata {
    /// Opaque id, unique within a process
    pub request_id: String,
    /// Wall-clock milliseconds at creation
    pub timestamp: i64,
    #[serde(default)]
    pub provenance: Provenance,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

impl RequestMetadata {
    /// Fresh metadata stamped by the named frontend.
    pub fn stamped(frontend: &str) -> Self {
        Self {
            request_id: format!("req_{}", uuid::Uuid::new_v4().simple()),
            timestamp: chrono::Utc::now().timestamp_millis(),
            provenance: Provenance {
                frontend: Some(frontend.to_string()),
                backend: None,
                router: None,
            },
            custom: HashMap::new(),
        }
    }

    /// Like `stamped`, but keeps a caller-provided id.
    pub fn stamped_with_id(frontend: &str, request_id: Option<String>) -> Self {
        let mut metadata = Self::stamped(frontend);
        if let Some(id) = request_id {
            metadata.request_id = id;
        }
        metadata
    }
}

/// The canonical chat request every frontend produces and every backend consumes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IrChatRequest {
    pub messages: Vec<IrMessage>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_mode: Option<StreamMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaSpec>,
    pub metadata: RequestMetadata,
}

impl IrChatRequest {
    pub fn new(messages: Vec<IrMessage>, metadata: RequestMetadata) -> Self {
        Self {
            messages,
            parameters: Parameters::default(),
            stream: false,
            stream_mode: None,
            schema: None,
            metadata,
        }
    }

    /// Structural validation of the request and its parameter ranges.
    pub fn validate(&self) -> Result<(), ChatError> {
        if self.messages.is_empty() {
            return Err(ChatError::validation(
                "empty_messages",
                "request must contain at least one message",
            ));
        }

        for (idx, msg) in self.messages.iter().enumerate() {
            if msg.role == Role::Tool && msg.name.is_none() {
                return Err(ChatError::validation(
                    "tool_message_without_name",
                    format!("tool message at index {} is missing a name", idx),
                ));
            }
        }

        let params = &self.parameters;
        if let Some(t) = params.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ChatError::validation(
                    "temperature_out_of_range",
                    format!("temperature {} must be within 0.0..=2.0", t),
                ));
            }
        }
        if let Some(p) = params.top_p {
            if !(0.0..=1.0).contains(&p) {
                return Err(ChatError::validation(
                    "top_p_out_of_range",
                    format!("top_p {} must be within 0.0..=1.0", p),
                ));
            }
        }
        if let Some(fp) = params.frequency_penalty {
            if !(-2.0..=2.0).contains(&fp) {
                return Err(ChatError::validation(
                    "frequency_penalty_out_of_range",
                    format!("frequency_penalty {} must be within -2.0..=2.0", fp),
                ));
            }
        }
        if let Some(pp) = params.presence_penalty {
            if !(-2.0..=2.0).contains(&pp) {
                return Err(ChatError::validation(
                    "presence_penalty_out_of_range",
                    format!("presence_penalty {} must be within -2.0..=2.0", pp),
                ));
            }
        }
        if params.stop_sequences.iter().any(|s| s.is_empty()) {
            return Err(ChatError::validation(
                "empty_stop_sequence",
                "stop sequences must be non-empty strings",
            ));
        }

        Ok(())
    }

    /// Messages with the system role, in order.
    pub fn system_messages(&self) -> Vec<&IrMessage> {
        self.messages
            .iter()
            .filter(|m| m.role == Role::System)
            .collect()
    }
}
