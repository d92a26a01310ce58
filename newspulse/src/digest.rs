use anyhow::{Context, Result};
use common::PersonaConfig;
use std::sync::Arc;
use tracing::{debug, info};

use crate::aggregator::NewsBatch;
use crate::llm::{LlmProvider, LlmRequest};

const NEWS_PLACEHOLDER: &str = "{news}";

/// The text handed to delivery for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestMessage {
    pub text: String,
    /// True when nothing new was found and the persona fallback was used.
    pub is_fallback: bool,
}

/// Persona framing for the digest.
#[derive(Debug, Clone)]
pub struct Persona {
    pub system_prompt: String,
    /// Template with a `{news}` placeholder for the numbered items.
    pub instructions: String,
    pub fallback: String,
}

impl Persona {
    pub fn from_config(cfg: &PersonaConfig) -> Self {
        Self {
            system_prompt: cfg.system_prompt().to_string(),
            instructions: cfg.instructions().to_string(),
            fallback: cfg.fallback().to_string(),
        }
    }
}

impl Default for Persona {
    fn default() -> Self {
        Self::from_config(&PersonaConfig::default())
    }
}

/// Sampling parameters for the digest completion.
#[derive(Debug, Clone, Copy)]
pub struct Sampling {
    pub temperature: f32,
    pub max_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.85,
            max_tokens: None,
            timeout_seconds: None,
        }
    }
}

/// Turns a batch of fresh items into one persona-flavored Markdown message.
pub struct DigestComposer {
    provider: Arc<dyn LlmProvider>,
    persona: Persona,
    sampling: Sampling,
}

impl DigestComposer {
    pub fn new(provider: Arc<dyn LlmProvider>, persona: Persona) -> Self {
        Self {
            provider,
            persona,
            sampling: Sampling::default(),
        }
    }

    pub fn with_sampling(mut self, sampling: Sampling) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Compose the digest. An empty batch short-circuits to the fallback text
    /// without calling the model; any model failure is returned as an error.
    pub async fn compose(&self, batch: &NewsBatch) -> Result<DigestMessage> {
        if batch.is_empty() {
            debug!("empty batch, using fallback digest");
            return Ok(DigestMessage {
                text: self.persona.fallback.clone(),
                is_fallback: true,
            });
        }

        let request = LlmRequest {
            prompt: self.build_prompt(batch),
            system: Some(self.persona.system_prompt.clone()),
            max_tokens: self.sampling.max_tokens,
            temperature: Some(self.sampling.temperature),
            timeout_seconds: self.sampling.timeout_seconds,
        };

        let response = self
            .provider
            .generate(request)
            .await
            .context("digest generation failed")?;

        let text = response.content.trim();
        if text.is_empty() {
            anyhow::bail!("digest generation returned an empty completion");
        }

        info!(
            items = batch.len(),
            model = %response.model,
            total_tokens = response.usage.total_tokens,
            "digest composed"
        );

        Ok(DigestMessage {
            text: text.to_string(),
            is_fallback: false,
        })
    }

    /// Persona instructions with the numbered items filled in.
    pub fn build_prompt(&self, batch: &NewsBatch) -> String {
        let news = numbered_list(&batch.entries());
        if self.persona.instructions.contains(NEWS_PLACEHOLDER) {
            self.persona.instructions.replace(NEWS_PLACEHOLDER, &news)
        } else {
            format!("{}\n\n{}", self.persona.instructions, news)
        }
    }
}

/// `1. first`, blank line, `2. second`, ...
pub fn numbered_list(entries: &[String]) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| format!("{}. {}", i + 1, entry))
        .collect::<Vec<_>>()
        .join("\n\n")
}
