//! Lossy-conversion reporting and the message/parameter reshaping every
//! backend applies before touching the wire.
//!
//! Translation steps that change observable behavior (merging system
//! messages, scaling a parameter, dropping a feature) never fail silently;
//! they return `SemanticWarning` entries that ride on the response metadata.

use crate::capability::{CapabilityDescriptor, SystemMessageStrategy};
use crate::ir::message::{ContentBlock, IrMessage, MessageContent, Role};
use crate::ir::request::IrChatRequest;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ParameterScaling,
    UnsupportedFeature,
    MessagesMerged,
    SystemInterleaved,
    StopSequencesTruncated,
}

/// A single recorded semantic drift
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SemanticWarning {
    pub kind: WarningKind,
    /// The IR field or feature the drift applies to
    pub field: String,
    pub message: String,
}

impl SemanticWarning {
    pub fn new(kind: WarningKind, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result of reshaping system messages for one backend
#[derive(Debug, Clone)]
pub struct SystemNormalization {
    /// The message array to send, system entries reshaped per strategy
    pub messages: Vec<IrMessage>,
    /// Collapsed system text for separate-parameter providers
    pub system_param: Option<String>,
    pub warnings: Vec<SemanticWarning>,
}

/// Reshape system messages according to the backend's declared strategy.
pub fn normalize_system_messages(
    messages: &[IrMessage],
    caps: &CapabilityDescriptor,
) -> SystemNormalization {
    let mut warnings = Vec::new();

    let system_count = messages.iter().filter(|m| m.role == Role::System).count();
    let interleaved = has_interleaved_system(messages);

    match caps.system_message_strategy {
        SystemMessageStrategy::InMessages => {
            if caps.supports_multiple_system_messages || system_count <= 1 {
                return SystemNormalization {
                    messages: messages.to_vec(),
                    system_param: None,
                    warnings,
                };
            }
            // Merge every system message into the first one, preserving order
            let merged = join_system_text(messages);
            let mut out = Vec::with_capacity(messages.len());
            let mut placed = false;
            for msg in messages {
                if msg.role == Role::System {
                    if !placed {
                        out.push(IrMessage::system(merged.clone()));
                        placed = true;
                    }
                } else {
                    out.push(msg.clone());
                }
            }
            warnings.push(SemanticWarning::new(
                WarningKind::MessagesMerged,
                "messages",
                format!("{} system messages merged into one", system_count),
            ));
            SystemNormalization {
                messages: out,
                system_param: None,
                warnings,
            }
        }
        SystemMessageStrategy::SeparateParameter => {
            let system_param = if system_count > 0 {
                Some(join_system_text(messages))
            } else {
                None
            };
            if system_count > 1 {
                warnings.push(SemanticWarning::new(
                    WarningKind::MessagesMerged,
                    "system",
                    format!(
                        "{} system messages collapsed into the system parameter",
                        system_count
                    ),
                ));
            }
            if interleaved {
                warnings.push(SemanticWarning::new(
                    WarningKind::SystemInterleaved,
                    "messages",
                    "system messages appeared after non-system messages; original ordering is lost",
                ));
            }
            SystemNormalization {
                messages: strip_system(messages),
                system_param,
                warnings,
            }
        }
        SystemMessageStrategy::PrependUser => {
            if system_count == 0 {
                return SystemNormalization {
                    messages: messages.to_vec(),
                    system_param: None,
                    warnings,
                };
            }
            let system_text = join_system_text(messages);
            let mut out = strip_system(messages);
            if let Some(first_user) = out.iter_mut().find(|m| m.role == Role::User) {
                let existing = first_user.content.text();
                first_user.content =
                    MessageContent::Text(format!("{}\n\n{}", system_text, existing));
            } else {
                out.insert(0, IrMessage::user(system_text));
            }
            warnings.push(SemanticWarning::new(
                WarningKind::MessagesMerged,
                "messages",
                "system messages prepended to the first user message",
            ));
            SystemNormalization {
                messages: out,
                system_param: None,
                warnings,
            }
        }
        SystemMessageStrategy::None => {
            if system_count > 0 {
                warnings.push(SemanticWarning::new(
                    WarningKind::UnsupportedFeature,
                    "system",
                    format!(
                        "backend has no system-message support; {} dropped",
                        system_count
                    ),
                ));
            }
            SystemNormalization {
                messages: strip_system(messages),
                system_param: None,
                warnings,
            }
        }
    }
}

fn join_system_text(messages: &[IrMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.text())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn strip_system(messages: &[IrMessage]) -> Vec<IrMessage> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect()
}

fn has_interleaved_system(messages: &[IrMessage]) -> bool {
    let mut seen_non_system = false;
    for msg in messages {
        if msg.role == Role::System {
            if seen_non_system {
                return true;
            }
        } else {
            seen_non_system = true;
        }
    }
    false
}

/// Linearly map a temperature from the canonical 0..=2 domain onto a
/// provider whose maximum differs. The IR value itself is never mutated.
pub fn scale_temperature(value: f32, provider_max: f32) -> (f32, Option<SemanticWarning>) {
    const IR_MAX: f32 = 2.0;
    if (provider_max - IR_MAX).abs() < f32::EPSILON {
        return (value, None);
    }
    let scaled = value * provider_max / IR_MAX;
    let warning = SemanticWarning::new(
        WarningKind::ParameterScaling,
        "temperature",
        format!(
            "temperature {} scaled to {} for a 0..={} provider",
            value, scaled, provider_max
        ),
    );
    (scaled, Some(warning))
}

/// Cap a stop-sequence list at the backend's limit.
pub fn truncate_stop_sequences(
    sequences: &[String],
    max: usize,
) -> (Vec<String>, Option<SemanticWarning>) {
    if sequences.len() <= max {
        return (sequences.to_vec(), None);
    }
    let kept: Vec<String> = sequences.iter().take(max).cloned().collect();
    let warning = SemanticWarning::new(
        WarningKind::StopSequencesTruncated,
        "stop_sequences",
        format!(
            "{} stop sequences truncated to the backend limit of {}",
            sequences.len(),
            max
        ),
    );
    (kept, Some(warning))
}

/// One warning per request feature the backend cannot honor.
pub fn unsupported_feature_warnings(
    request: &IrChatRequest,
    caps: &CapabilityDescriptor,
) -> Vec<SemanticWarning> {
    let mut warnings = Vec::new();
    let params = &request.parameters;

    let uses_tools = request.messages.iter().any(|m| {
        matches!(&m.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(
                b,
                ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. }
            )))
    });
    if uses_tools && !caps.tools {
        warnings.push(SemanticWarning::new(
            WarningKind::UnsupportedFeature,
            "tools",
            "backend does not support tool calling; tool blocks are passed as text",
        ));
    }

    let uses_images = request.messages.iter().any(|m| {
        matches!(&m.content, MessageContent::Blocks(blocks)
            if blocks.iter().any(|b| matches!(b, ContentBlock::Image { .. })))
    });
    if uses_images && !caps.multi_modal {
        warnings.push(SemanticWarning::new(
            WarningKind::UnsupportedFeature,
            "images",
            "backend does not accept image content; image blocks are dropped",
        ));
    }

    if params.seed.is_some() && !caps.supports_seed {
        warnings.push(unsupported_param("seed"));
    }
    if params.top_k.is_some() && !caps.supports_top_k {
        warnings.push(unsupported_param("top_k"));
    }
    if params.frequency_penalty.is_some() && !caps.supports_frequency_penalty {
        warnings.push(unsupported_param("frequency_penalty"));
    }
    if params.presence_penalty.is_some() && !caps.supports_presence_penalty {
        warnings.push(unsupported_param("presence_penalty"));
    }
    if params.temperature.is_some() && !caps.supports_temperature {
        warnings.push(unsupported_param("temperature"));
    }
    if params.top_p.is_some() && !caps.supports_top_p {
        warnings.push(unsupported_param("top_p"));
    }

    warnings
}

fn unsupported_param(field: &str) -> SemanticWarning {
    SemanticWarning::new(
        WarningKind::UnsupportedFeature,
        field,
        format!("backend ignores the {} parameter", field),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::request::{Parameters, RequestMetadata};

    fn caps_with(strategy: SystemMessageStrategy, multiple: bool) -> CapabilityDescriptor {
        CapabilityDescriptor {
            system_message_strategy: strategy,
            supports_multiple_system_messages: multiple,
            ..CapabilityDescriptor::default()
        }
    }

    #[test]
    fn test_in_messages_passthrough() {
        let messages = vec![IrMessage::system("a"), IrMessage::user("hi")];
        let out = normalize_system_messages(
            &messages,
            &caps_with(SystemMessageStrategy::InMessages, true),
        );
        assert_eq!(out.messages, messages);
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn test_in_messages_merges_when_single_only() {
        let messages = vec![
            IrMessage::system("be brief"),
            IrMessage::system("be kind"),
            IrMessage::user("hi"),
        ];
        let out = normalize_system_messages(
            &messages,
            &caps_with(SystemMessageStrategy::InMessages, false),
        );
        assert_eq!(out.messages.len(), 2);
        assert_eq!(out.messages[0].content.text(), "be brief\n\nbe kind");
        assert_eq!(out.warnings.len(), 1);
        assert_eq!(out.warnings[0].kind, WarningKind::MessagesMerged);
    }

    #[test]
    fn test_separate_parameter_collapse_and_interleave() {
        let messages = vec![
            IrMessage::system("first"),
            IrMessage::user("hi"),
            IrMessage::system("second"),
        ];
        let out = normalize_system_messages(
            &messages,
            &caps_with(SystemMessageStrategy::SeparateParameter, false),
        );
        assert_eq!(out.system_param.as_deref(), Some("first\n\nsecond"));
        assert_eq!(out.messages.len(), 1);
        let kinds: Vec<_> = out.warnings.iter().map(|w| w.kind).collect();
        assert!(kinds.contains(&WarningKind::MessagesMerged));
        assert!(kinds.contains(&WarningKind::SystemInterleaved));
    }

    #[test]
    fn test_prepend_user() {
        let messages = vec![IrMessage::system("be brief"), IrMessage::user("hi")];
        let out = normalize_system_messages(
            &messages,
            &caps_with(SystemMessageStrategy::PrependUser, false),
        );
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content.text(), "be brief\n\nhi");
    }

    #[test]
    fn test_prepend_user_without_user_message() {
        let messages = vec![IrMessage::system("be brief"), IrMessage::assistant("ok")];
        let out = normalize_system_messages(
            &messages,
            &caps_with(SystemMessageStrategy::PrependUser, false),
        );
        assert_eq!(out.messages[0].role, Role::User);
        assert_eq!(out.messages[0].content.text(), "be brief");
    }

    #[test]
    fn test_none_drops_with_warning() {
        let messages = vec![IrMessage::system("be brief"), IrMessage::user("hi")];
        let out =
            normalize_system_messages(&messages, &caps_with(SystemMessageStrategy::None, false));
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.warnings[0].kind, WarningKind::UnsupportedFeature);
    }

    #[test]
    fn test_scale_temperature() {
        let (same, warning) = scale_temperature(1.4, 2.0);
        assert_eq!(same, 1.4);
        assert!(warning.is_none());

        let (scaled, warning) = scale_temperature(1.4, 1.0);
        assert!((scaled - 0.7).abs() < 1e-6);
        assert_eq!(warning.unwrap().kind, WarningKind::ParameterScaling);
    }

    #[test]
    fn test_truncate_stop_sequences() {
        let seqs: Vec<String> = (0..6).map(|i| format!("s{}", i)).collect();
        let (kept, warning) = truncate_stop_sequences(&seqs, 4);
        assert_eq!(kept.len(), 4);
        assert_eq!(kept[3], "s3");
        assert_eq!(warning.unwrap().kind, WarningKind::StopSequencesTruncated);

        let (kept, warning) = truncate_stop_sequences(&seqs, 8);
        assert_eq!(kept.len(), 6);
        assert!(warning.is_none());
    }

    #[test]
    fn test_unsupported_feature_sweep() {
        let mut params = Parameters::default();
        params.seed = Some(7);
        params.top_k = Some(40);
        let request = IrChatRequest {
            messages: vec![IrMessage::user("hi")],
            parameters: params,
            stream: false,
            stream_mode: None,
            schema: None,
            metadata: RequestMetadata::stamped("test"),
        };
        let caps = CapabilityDescriptor::default();
        let warnings = unsupported_feature_warnings(&request, &caps);
        let fields: Vec<_> = warnings.iter().map(|w| w.field.as_str()).collect();
        assert!(fields.contains(&"seed"));
        assert!(fields.contains(&"top_k"));
        assert!(!fields.contains(&"temperature"));
    }
}
