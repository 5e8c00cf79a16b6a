use crate::ir::message::IrMessage;
use crate::ir::response::{FinishReason, ResponseMetadata, TokenUsage};
use serde::{Deserialize, Serialize};

/// One element of a normalized chunk stream
///
/// A well-formed stream is: exactly one `Start` (sequence 0), zero or more
/// `Content` / `ToolCallDelta` chunks with strictly increasing sequence, and
/// exactly one terminator, either `Done` or `Error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IrStreamChunk {
    Start {
        sequence: u64,
        metadata: ResponseMetadata,
    },
    Content {
        sequence: u64,
        /// Incremental substring for this chunk
        delta: String,
        /// Concatenation of all deltas so far, present in accumulated mode
        #[serde(skip_serializing_if = "Option::is_none")]
        accumulated: Option<String>,
    },
    ToolCallDelta {
        sequence: u64,
        /// Position of the tool call within the response
        index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        arguments_delta: String,
    },
    Done {
        sequence: u64,
        finish_reason: FinishReason,
        /// The fully assembled assistant message
        message: IrMessage,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<TokenUsage>,
        metadata: ResponseMetadata,
    },
    Error {
        sequence: u64,
        code: String,
        message: String,
    },
}

impl IrStreamChunk {
    pub fn sequence(&self) -> u64 {
        match self {
            IrStreamChunk::Start { sequence, .. }
            | IrStreamChunk::Content { sequence, .. }
            | IrStreamChunk::ToolCallDelta { sequence, .. }
            | IrStreamChunk::Done { sequence, .. }
            | IrStreamChunk::Error { sequence, .. } => *sequence,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IrStreamChunk::Done { .. } | IrStreamChunk::Error { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_accessor() {
        let chunk = IrStreamChunk::Content {
            sequence: 3,
            delta: "hi".to_string(),
            accumulated: None,
        };
        assert_eq!(chunk.sequence(), 3);
        assert!(!chunk.is_terminal());

        let err = IrStreamChunk::Error {
            sequence: 4,
            code: "stream_error".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.is_terminal());
    }

    #[test]
    fn test_chunk_serde_tag() {
        let chunk = IrStreamChunk::Content {
            sequence: 1,
            delta: "He".to_string(),
            accumulated: Some("He".to_string()),
        };
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "content");
        assert_eq!(json["delta"], "He");
        assert_eq!(json["accumulated"], "He");
    }
}
