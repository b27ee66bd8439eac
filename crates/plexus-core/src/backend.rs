use crate::PlexusResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Knobs passed to a [`ModelBackend`] for a single generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub system_prompt: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

/// Token accounting reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Text produced by a [`ModelBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl Generation {
    /// Generation with zero usage, handy for canned backends.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            usage: TokenUsage::default(),
        }
    }
}

/// Trait for language-model text generation.
///
/// Must be safe to call concurrently: several planning calls may share one
/// backend instance.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Generate a completion for `prompt`.
    async fn generate(&self, prompt: &str, options: &GenerationOptions)
        -> PlexusResult<Generation>;
}
