//! LLM providers backing the classification workers.

use std::sync::Arc;

pub mod contract;
pub mod ollama;
pub mod openai;
pub mod provider;

pub use contract::{execute_with_contract, ExecutionContract, ExecutionError, FailureCode};
pub use provider::{Provider, ProviderError};

use crate::config::ProviderConfig;
use crate::error::{Error, Result};

/// Build the configured provider.
///
/// A hosted provider without credentials is an initialization error.
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.name.as_str() {
        "ollama" => Ok(Arc::new(ollama::OllamaProvider::new(
            config.base_url.clone(),
            config.model.clone(),
        ))),
        "openai" => {
            let api_key = config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| {
                    Error::Initialization(
                        "openai provider needs provider.api_key or OPENAI_API_KEY".to_string(),
                    )
                })?;
            Ok(Arc::new(openai::OpenAiProvider::new(
                api_key,
                config.base_url.clone(),
                config.model.clone(),
            )))
        }
        other => Err(Error::Initialization(format!("Unknown provider '{}'", other))),
    }
}

/// Build the configured provider and check that it can be reached.
pub async fn check_provider(config: &ProviderConfig) -> Result<bool> {
    let provider = create_provider(config)?;
    let reachable = provider.is_available().await;
    if reachable {
        tracing::debug!("Provider {} is reachable", provider.name());
    } else {
        tracing::warn!("Provider {} is not reachable", provider.name());
    }
    Ok(reachable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_ollama() {
        let provider = create_provider(&ProviderConfig::default()).unwrap();
        assert_eq!(provider.name(), "ollama");
        assert_eq!(provider.default_model(), Some("llama3.2"));
    }

    #[test]
    fn test_openai_with_explicit_key() {
        let config = ProviderConfig {
            name: "openai".to_string(),
            api_key: Some("sk-test".to_string()),
            ..ProviderConfig::default()
        };
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.name(), "openai");
    }

    #[test]
    fn test_unknown_provider_is_initialization_error() {
        let config = ProviderConfig {
            name: "telepathy".to_string(),
            ..ProviderConfig::default()
        };
        assert!(matches!(
            create_provider(&config),
            Err(Error::Initialization(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_provider() {
        let config = ProviderConfig {
            base_url: Some("http://127.0.0.1:9".to_string()),
            ..ProviderConfig::default()
        };
        assert!(!check_provider(&config).await.unwrap());
    }
}
