//! Streaming normalization: chunk numbering, delta/accumulated emission,
//! tool-call delta reassembly, and post-hoc mode conversion.

use crate::adapter::ChunkStream;
use crate::error::ChatError;
use crate::ir::chunk::IrStreamChunk;
use crate::ir::message::ContentBlock;
use crate::ir::request::StreamMode;
use crate::ir::response::{FinishReason, ResponseMetadata, TokenUsage};
use crate::ir::IrMessage;
use futures::StreamExt;
use std::collections::BTreeMap;

/// Per-backend streaming defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamingConfig {
    pub mode: StreamMode,
    /// Force both `delta` and `accumulated` on every content chunk
    pub include_both: bool,
}

impl StreamingConfig {
    /// Effective config for one request: the request's mode wins over the
    /// backend default.
    pub fn for_request(self, request_mode: Option<StreamMode>) -> Self {
        Self {
            mode: request_mode.unwrap_or(self.mode),
            include_both: self.include_both,
        }
    }

    fn wants_accumulated(&self) -> bool {
        self.include_both || self.mode == StreamMode::Accumulated
    }
}

/// Builder every stream producer drives: assigns sequence numbers, keeps the
/// running content buffer, and shapes chunks per the configured mode.
#[derive(Debug)]
pub struct ChunkBuilder {
    config: StreamingConfig,
    sequence: u64,
    content: String,
}

impl ChunkBuilder {
    pub fn new(config: StreamingConfig) -> Self {
        Self {
            config,
            sequence: 0,
            content: String::new(),
        }
    }

    fn next_sequence(&mut self) -> u64 {
        let seq = self.sequence;
        self.sequence += 1;
        seq
    }

    /// Text accumulated so far.
    pub fn text(&self) -> &str {
        &self.content
    }

    /// Drop all accumulated state, used on cancellation.
    pub fn clear(&mut self) {
        self.content.clear();
    }

    pub fn start(&mut self, metadata: ResponseMetadata) -> IrStreamChunk {
        IrStreamChunk::Start {
            sequence: self.next_sequence(),
            metadata,
        }
    }

    pub fn content(&mut self, delta: impl Into<String>) -> IrStreamChunk {
        let delta = delta.into();
        self.content.push_str(&delta);
        IrStreamChunk::Content {
            sequence: self.next_sequence(),
            delta,
            accumulated: self
                .config
                .wants_accumulated()
                .then(|| self.content.clone()),
        }
    }

    pub fn tool_call_delta(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: impl Into<String>,
    ) -> IrStreamChunk {
        IrStreamChunk::ToolCallDelta {
            sequence: self.next_sequence(),
            index,
            id,
            name,
            arguments_delta: arguments_delta.into(),
        }
    }

    pub fn done(
        &mut self,
        finish_reason: FinishReason,
        message: IrMessage,
        usage: Option<TokenUsage>,
        metadata: ResponseMetadata,
    ) -> IrStreamChunk {
        IrStreamChunk::Done {
            sequence: self.next_sequence(),
            finish_reason,
            message,
            usage,
            metadata,
        }
    }

    /// Done chunk whose message is the accumulated text.
    pub fn done_with_text(
        &mut self,
        finish_reason: FinishReason,
        usage: Option<TokenUsage>,
        metadata: ResponseMetadata,
    ) -> IrStreamChunk {
        let message = IrMessage::assistant(self.content.clone());
        self.done(finish_reason, message, usage, metadata)
    }

    pub fn error(&mut self, code: impl Into<String>, message: impl Into<String>) -> IrStreamChunk {
        IrStreamChunk::Error {
            sequence: self.next_sequence(),
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    yielded_length: usize,
}

/// Reassembles incremental tool-call argument text keyed by tool-call index.
///
/// Providers stream the id and name once and the JSON arguments in fragments;
/// `apply` buffers a fragment and returns only the newly appended substring so
/// downstream consumers see an incrementally growing JSON string.
#[derive(Debug, Default)]
pub struct ToolCallReassembler {
    calls: BTreeMap<usize, PartialToolCall>,
}

impl ToolCallReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Buffer one delta; returns the substring appended by this call.
    pub fn apply(
        &mut self,
        index: usize,
        id: Option<String>,
        name: Option<String>,
        arguments_delta: Option<String>,
    ) -> String {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = Some(id);
        }
        if let Some(name) = name {
            call.name = Some(name);
        }
        if let Some(delta) = arguments_delta {
            call.arguments.push_str(&delta);
        }
        let appended = call.arguments[call.yielded_length..].to_string();
        call.yielded_length = call.arguments.len();
        appended
    }

    /// Convert the buffers into ordered tool-use blocks. Arguments that fail
    /// to parse are preserved under a `raw` key; a call is never dropped.
    pub fn finish(self) -> Vec<ContentBlock> {
        self.calls
            .into_values()
            .map(|call| {
                let input = match serde_json::from_str::<serde_json::Value>(&call.arguments) {
                    Ok(value) => value,
                    Err(_) => serde_json::json!({ "raw": call.arguments }),
                };
                ContentBlock::ToolUse {
                    id: call.id.unwrap_or_default(),
                    name: call.name.unwrap_or_default(),
                    input,
                }
            })
            .collect()
    }
}

/// Re-emit a chunk stream in another emission mode, preserving sequence
/// numbers. Delta-from-accumulated is recovered by prefix subtraction.
pub fn convert_stream_mode(
    stream: ChunkStream,
    target: StreamMode,
    include_both: bool,
) -> ChunkStream {
    let converted = async_stream::stream! {
        let mut previous = String::new();
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            match item {
                Ok(IrStreamChunk::Content { sequence, delta, accumulated }) => {
                    let full = match &accumulated {
                        Some(acc) => acc.clone(),
                        None => format!("{}{}", previous, delta),
                    };
                    let effective_delta = if delta.is_empty() && full.len() >= previous.len() {
                        full[previous.len()..].to_string()
                    } else {
                        delta
                    };
                    previous = full.clone();
                    let accumulated = (include_both || target == StreamMode::Accumulated)
                        .then_some(full);
                    yield Ok(IrStreamChunk::Content {
                        sequence,
                        delta: effective_delta,
                        accumulated,
                    });
                }
                other => yield other,
            }
        }
    };
    Box::pin(converted)
}

pub fn to_delta(stream: ChunkStream) -> ChunkStream {
    convert_stream_mode(stream, StreamMode::Delta, false)
}

pub fn to_accumulated(stream: ChunkStream) -> ChunkStream {
    convert_stream_mode(stream, StreamMode::Accumulated, false)
}

/// Check the chunk-protocol invariants over a fully collected stream.
pub fn validate_chunk_sequence(chunks: &[IrStreamChunk]) -> Result<(), ChatError> {
    let Some(first) = chunks.first() else {
        return Err(ChatError::stream("empty_stream", "stream yielded no chunks"));
    };
    if !matches!(first, IrStreamChunk::Start { sequence: 0, .. }) {
        return Err(ChatError::stream(
            "missing_start",
            "stream must begin with a start chunk at sequence 0",
        ));
    }

    let mut terminators = 0usize;
    let mut concatenated = String::new();
    for (idx, chunk) in chunks.iter().enumerate() {
        if chunk.sequence() != idx as u64 {
            return Err(ChatError::stream(
                "sequence_gap",
                format!(
                    "chunk at position {} carries sequence {}",
                    idx,
                    chunk.sequence()
                ),
            ));
        }
        match chunk {
            IrStreamChunk::Start { .. } if idx != 0 => {
                return Err(ChatError::stream("duplicate_start", "second start chunk"));
            }
            IrStreamChunk::Content { delta, .. } => concatenated.push_str(delta),
            IrStreamChunk::Done { message, .. } => {
                terminators += 1;
                if message.text() != concatenated {
                    return Err(ChatError::stream(
                        "content_mismatch",
                        "concatenated deltas differ from the final message text",
                    ));
                }
            }
            IrStreamChunk::Error { .. } => terminators += 1,
            _ => {}
        }
    }

    if terminators != 1 || !chunks.last().map(IrStreamChunk::is_terminal).unwrap_or(false) {
        return Err(ChatError::stream(
            "bad_terminator",
            "stream must end with exactly one done or error chunk",
        ));
    }
    Ok(())
}
