use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a backend expects system messages to be delivered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SystemMessageStrategy {
    /// System messages travel inside the message array
    #[default]
    InMessages,
    /// Collapsed into a dedicated system field on the request
    SeparateParameter,
    /// Concatenated onto the front of the first user message
    PrependUser,
    /// The provider has no system-message concept; they are dropped
    None,
}

/// Feature matrix a backend advertises for routing and drift reporting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityDescriptor {
    pub streaming: bool,
    pub multi_modal: bool,
    pub tools: bool,
    pub supports_multiple_system_messages: bool,
    pub supports_temperature: bool,
    pub supports_top_p: bool,
    pub supports_top_k: bool,
    pub supports_seed: bool,
    pub supports_frequency_penalty: bool,
    pub supports_presence_penalty: bool,
    pub max_context_tokens: u32,
    pub max_stop_sequences: usize,
    pub system_message_strategy: SystemMessageStrategy,
    /// Adapter-documented details such as the temperature scaling mapping
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub custom: HashMap<String, serde_json::Value>,
}

impl Default for CapabilityDescriptor {
    fn default() -> Self {
        Self {
            streaming: true,
            multi_modal: false,
            tools: false,
            supports_multiple_system_messages: false,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: false,
            supports_seed: false,
            supports_frequency_penalty: false,
            supports_presence_penalty: false,
            max_context_tokens: 128_000,
            max_stop_sequences: 4,
            system_message_strategy: SystemMessageStrategy::InMessages,
            custom: HashMap::new(),
        }
    }
}

impl CapabilityDescriptor {
    /// Descriptor with every feature enabled, used by routers that defer the
    /// real answer to the selected backend.
    pub fn permissive() -> Self {
        Self {
            streaming: true,
            multi_modal: true,
            tools: true,
            supports_multiple_system_messages: true,
            supports_temperature: true,
            supports_top_p: true,
            supports_top_k: true,
            supports_seed: true,
            supports_frequency_penalty: true,
            supports_presence_penalty: true,
            max_context_tokens: u32::MAX,
            max_stop_sequences: usize::MAX,
            system_message_strategy: SystemMessageStrategy::InMessages,
            custom: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_value(SystemMessageStrategy::SeparateParameter).unwrap();
        assert_eq!(json, "separate-parameter");
        let json = serde_json::to_value(SystemMessageStrategy::PrependUser).unwrap();
        assert_eq!(json, "prepend-user");
    }

    #[test]
    fn test_permissive_allows_everything() {
        let caps = CapabilityDescriptor::permissive();
        assert!(caps.tools && caps.multi_modal && caps.supports_seed);
        assert_eq!(caps.max_stop_sequences, usize::MAX);
    }
}
