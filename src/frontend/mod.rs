// Frontend adapters: provider surface syntax to IR and back

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicFrontend;
pub use gemini::GeminiFrontend;
pub use openai::OpenAiFrontend;
