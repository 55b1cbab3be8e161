//! LLM provider trait used by classification workers.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Request timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// A chat-completion backend.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Check if the provider can be reached.
    async fn is_available(&self) -> bool;

    /// Complete a prompt, optionally overriding the default model.
    async fn complete(&self, prompt: &str, model: Option<&str>) -> Result<String>;

    /// Get the default model.
    fn default_model(&self) -> Option<&str>;
}

impl ProviderError {
    /// Sort a failed request into timeout, unreachable or plain HTTP errors.
    pub fn from_request(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout
        } else if e.is_connect() {
            ProviderError::NotAvailable(e.to_string())
        } else {
            ProviderError::HttpError(e)
        }
    }
}
