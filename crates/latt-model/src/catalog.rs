// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model catalog: static metadata for known models, consulted when a caller
//! does not supply an explicit context window or output-token cap.

use serde::{Deserialize, Serialize};

/// Input modalities supported by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

fn default_input_modalities() -> Vec<InputModality> {
    vec![InputModality::Text]
}

/// Metadata for a single model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelCatalogEntry {
    /// Provider-scoped model identifier (e.g. "gpt-4o", "claude-opus-4-6").
    pub id: String,
    pub name: String,
    /// Provider identifier: "openai" | "anthropic" | "mock" | ...
    pub provider: String,
    /// Total context window in tokens (input + output).
    pub context_window: u32,
    /// Maximum output tokens per completion.
    pub max_output_tokens: u32,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_modalities")]
    pub input_modalities: Vec<InputModality>,
}

impl ModelCatalogEntry {
    pub fn supports_images(&self) -> bool {
        self.input_modalities.contains(&InputModality::Image)
    }
}

fn entry(
    id: &str,
    name: &str,
    provider: &str,
    context_window: u32,
    max_output_tokens: u32,
    description: &str,
    modalities: &[InputModality],
) -> ModelCatalogEntry {
    ModelCatalogEntry {
        id: id.into(),
        name: name.into(),
        provider: provider.into(),
        context_window,
        max_output_tokens,
        description: description.into(),
        input_modalities: modalities.to_vec(),
    }
}

/// Return all entries from the built-in static catalog.
///
/// This is a conservative, slowly-changing table (not a live model list) —
/// callers that need up-to-date pricing or context windows should override
/// [`crate::ModelProvider::catalog_context_window`] with a live probe.
pub fn static_catalog() -> Vec<ModelCatalogEntry> {
    use InputModality::{Image, Text};
    vec![
        entry("gpt-4o", "GPT-4o", "openai", 128_000, 16_384, "OpenAI flagship multimodal model", &[Text, Image]),
        entry("gpt-4o-mini", "GPT-4o mini", "openai", 128_000, 16_384, "OpenAI small multimodal model", &[Text, Image]),
        entry(
            "claude-opus-4-6",
            "Claude Opus",
            "anthropic",
            500_000,
            64_000,
            "Anthropic flagship reasoning model",
            &[Text, Image],
        ),
        entry(
            "claude-sonnet-4-6",
            "Claude Sonnet",
            "anthropic",
            500_000,
            64_000,
            "Anthropic balanced reasoning model",
            &[Text, Image],
        ),
        entry("mock-model", "Mock Model", "mock", 32_000, 4_096, "Deterministic mock used in tests", &[Text]),
    ]
}

/// Look up a single model by provider and id (or name).
pub fn lookup(provider: &str, model_id: &str) -> Option<ModelCatalogEntry> {
    static_catalog().into_iter().find(|e| e.provider == provider && (e.id == model_id || e.name == model_id))
}

/// Look up a model by bare model name (without provider prefix), checking
/// both `id` and `name`.
pub fn lookup_by_model_name(model_name: &str) -> Option<ModelCatalogEntry> {
    static_catalog().into_iter().find(|e| e.id == model_name || e.name == model_name)
}

/// Return `true` if the model supports image input, defaulting to `false`
/// when the model is not found in the catalog.
pub fn supports_images(provider: &str, model_id: &str) -> bool {
    lookup(provider, model_id).map(|e| e.supports_images()).unwrap_or(false)
}

/// Look up the context window for a model, falling back to `default` if
/// the model is unknown.
pub fn context_window(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.context_window).unwrap_or(default)
}

/// Look up the max output tokens for a model, falling back to `default` if
/// the model is unknown.
pub fn max_output_tokens(provider: &str, model_id: &str, default: u32) -> u32 {
    lookup(provider, model_id).map(|e| e.max_output_tokens).unwrap_or(default)
}

// ── Unit tests ────────────────────────────────────────────────────────────────
