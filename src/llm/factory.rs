//! LLM service factory.
//!
//! Centralizes provider selection: the model-name prefix decides which
//! service handles the request. Unknown prefixes fall back to Gemini with
//! a warning the client surfaces as an event.

use std::sync::Arc;
use std::time::Duration;

use super::retry::RetryPolicy;
use super::{AnthropicService, GeminiService, LlmService, OpenAiService};
use crate::config::AgentConfig;
use crate::error::{DbRheoError, Result};

/// Known providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Gemini,
    Anthropic,
    OpenAi,
}

/// Maps a model name to its provider by prefix. `None` means the name is
/// unrecognized and the caller should fall back.
pub fn provider_for_model(model: &str) -> Option<Provider> {
    let lowered = model.to_lowercase();
    if lowered.starts_with("gemini-") {
        return Some(Provider::Gemini);
    }
    if lowered.starts_with("claude-") || lowered.starts_with("sonnet") || lowered.starts_with("opus")
    {
        return Some(Provider::Anthropic);
    }
    if lowered.starts_with("gpt-") || lowered.starts_with("o3") || lowered.starts_with("o4") {
        return Some(Provider::OpenAi);
    }
    None
}

/// Creates the service for the configured model.
///
/// Returns the service plus an optional warning message (set when the
/// model prefix was unrecognized and Gemini was used as the fallback).
pub fn create_service(config: &AgentConfig) -> Result<(Arc<dyn LlmService>, Option<String>)> {
    let model = config.model();
    let timeout = Duration::from_secs(config.get_u64("llm.request_timeout_secs", 120));
    let retry = RetryPolicy::from_config(config);

    let (provider, warning) = match provider_for_model(&model) {
        Some(provider) => (provider, None),
        None => (
            Provider::Gemini,
            Some(format!(
                "Unknown model prefix '{model}'; falling back to the Gemini service"
            )),
        ),
    };

    let service: Arc<dyn LlmService> = match provider {
        Provider::Gemini => {
            let key = config.credential("gemini_api_key").ok_or_else(|| {
                DbRheoError::config(
                    "No Gemini API key configured. Set GEMINI_API_KEY or GOOGLE_API_KEY.",
                )
            })?;
            Arc::new(GeminiService::new(model, key, timeout, retry)?)
        }
        Provider::Anthropic => {
            let key = config.credential("anthropic_api_key").ok_or_else(|| {
                DbRheoError::config("No Anthropic API key configured. Set ANTHROPIC_API_KEY.")
            })?;
            Arc::new(AnthropicService::new(model, key, timeout, retry)?)
        }
        Provider::OpenAi => {
            let key = config.credential("openai_api_key").ok_or_else(|| {
                DbRheoError::config("No OpenAI API key configured. Set OPENAI_API_KEY.")
            })?;
            let base = config.credential("openai_api_base");
            Arc::new(OpenAiService::new(model, key, base, timeout, retry)?)
        }
    };

    Ok((service, warning))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_dispatch_by_prefix() {
        assert_eq!(provider_for_model("gemini-2.0-flash"), Some(Provider::Gemini));
        assert_eq!(
            provider_for_model("claude-sonnet-4-20250514"),
            Some(Provider::Anthropic)
        );
        assert_eq!(provider_for_model("sonnet-latest"), Some(Provider::Anthropic));
        assert_eq!(provider_for_model("opus-latest"), Some(Provider::Anthropic));
        assert_eq!(provider_for_model("gpt-4o"), Some(Provider::OpenAi));
        assert_eq!(provider_for_model("o3-mini"), Some(Provider::OpenAi));
        assert_eq!(provider_for_model("o4-mini"), Some(Provider::OpenAi));
        assert_eq!(provider_for_model("mistral-large"), None);
    }

    #[test]
    fn test_unknown_model_falls_back_to_gemini_with_warning() {
        let config = AgentConfig::for_tests(
            serde_yaml::from_str(
                "model: mistral-large\ncredentials:\n  gemini_api_key: test-key",
            )
            .unwrap(),
        );
        let (service, warning) = create_service(&config).unwrap();
        assert_eq!(service.model(), "mistral-large");
        assert!(warning.unwrap().contains("falling back"));
    }

    #[test]
    fn test_known_model_has_no_warning() {
        let config = AgentConfig::for_tests(
            serde_yaml::from_str(
                "model: gpt-4o\ncredentials:\n  openai_api_key: test-key",
            )
            .unwrap(),
        );
        let (service, warning) = create_service(&config).unwrap();
        assert_eq!(service.model(), "gpt-4o");
        assert!(warning.is_none());
    }

    #[test]
    fn test_missing_key_fails_loudly() {
        let config = AgentConfig::for_tests(serde_yaml::from_str("model: claude-3").unwrap());
        let err = match create_service(&config) {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.kind(), "ConfigError");
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }
}
