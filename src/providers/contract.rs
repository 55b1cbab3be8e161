//! Provider execution contracts: timeout, retries, and failure codes.

use std::sync::Arc;
use std::time::Duration;

use super::{Provider, ProviderError};
use crate::config::ProviderConfig;

#[derive(Debug, Clone)]
pub struct ExecutionContract {
    pub timeout_seconds: u64,
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ExecutionContract {
    fn default() -> Self {
        Self {
            timeout_seconds: 45,
            retries: 1,
            retry_backoff_ms: 600,
        }
    }
}

impl From<&ProviderConfig> for ExecutionContract {
    fn from(config: &ProviderConfig) -> Self {
        Self {
            timeout_seconds: config.timeout_seconds,
            retries: config.retries,
            retry_backoff_ms: config.retry_backoff_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCode {
    Timeout,
    Unauthorized,
    ProviderUnavailable,
    Unknown,
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureCode::Timeout => write!(f, "timeout"),
            FailureCode::Unauthorized => write!(f, "unauthorized"),
            FailureCode::ProviderUnavailable => write!(f, "provider_unavailable"),
            FailureCode::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub code: FailureCode,
    pub message: String,
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for ExecutionError {}

/// Run a completion under the contract's timeout, retrying with a fixed backoff.
pub async fn execute_with_contract(
    provider: Arc<dyn Provider>,
    prompt: &str,
    model: Option<&str>,
    contract: &ExecutionContract,
) -> Result<String, ExecutionError> {
    let attempts = contract.retries + 1;
    let timeout = Duration::from_secs(contract.timeout_seconds);
    let mut last_error: Option<ExecutionError> = None;

    for attempt in 1..=attempts {
        let result = tokio::time::timeout(timeout, provider.complete(prompt, model)).await;
        match result {
            Ok(Ok(text)) => return Ok(text),
            Ok(Err(e)) => {
                let err = classify_provider_error(&e);
                tracing::warn!(
                    "{} attempt {}/{} failed: {}",
                    provider.name(),
                    attempt,
                    attempts,
                    err
                );
                last_error = Some(err);
            }
            Err(_) => {
                let err = ExecutionError {
                    code: FailureCode::Timeout,
                    message: format!(
                        "provider completion exceeded timeout of {}s",
                        contract.timeout_seconds
                    ),
                };
                tracing::warn!(
                    "{} attempt {}/{} timed out",
                    provider.name(),
                    attempt,
                    attempts
                );
                last_error = Some(err);
            }
        }

        if attempt < attempts {
            tokio::time::sleep(Duration::from_millis(contract.retry_backoff_ms)).await;
        }
    }

    Err(last_error.unwrap_or(ExecutionError {
        code: FailureCode::Unknown,
        message: "execution failed for unknown reason".to_string(),
    }))
}

fn classify_provider_error(err: &ProviderError) -> ExecutionError {
    let code = match err {
        ProviderError::Timeout => FailureCode::Timeout,
        ProviderError::NotAvailable(_) => FailureCode::ProviderUnavailable,
        _ => return classify_error(&err.to_string()),
    };

    ExecutionError {
        code,
        message: err.to_string(),
    }
}

fn classify_error(message: &str) -> ExecutionError {
    let m = message.to_lowercase();
    let code = if m.contains("unauthorized")
        || m.contains("401")
        || m.contains("403")
        || m.contains("forbidden")
    {
        FailureCode::Unauthorized
    } else if m.contains("not available")
        || m.contains("connection")
        || m.contains("timeout")
        || m.contains("failed to connect")
    {
        FailureCode::ProviderUnavailable
    } else {
        FailureCode::Unknown
    };

    ExecutionError {
        code,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::provider::Result as ProviderResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails a fixed number of times, then answers.
    struct FlakyProvider {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Provider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(&self, _prompt: &str, _model: Option<&str>) -> ProviderResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ProviderError::NotAvailable("connection refused".to_string()));
            }
            Ok("{}".to_string())
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    fn contract(retries: u32) -> ExecutionContract {
        ExecutionContract {
            timeout_seconds: 5,
            retries,
            retry_backoff_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });

        let out = execute_with_contract(provider.clone(), "hi", None, &contract(1)).await;
        assert_eq!(out.unwrap(), "{}");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_error() {
        let provider = Arc::new(FlakyProvider {
            failures_left: AtomicU32::new(5),
            calls: AtomicU32::new(0),
        });

        let err = execute_with_contract(provider.clone(), "hi", None, &contract(1))
            .await
            .unwrap_err();
        assert_eq!(err.code, FailureCode::ProviderUnavailable);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("HTTP 401: nope").code, FailureCode::Unauthorized);
        assert_eq!(classify_error("weird").code, FailureCode::Unknown);
    }

    #[test]
    fn test_classify_provider_error() {
        assert_eq!(classify_provider_error(&ProviderError::Timeout).code, FailureCode::Timeout);
        assert_eq!(
            classify_provider_error(&ProviderError::NotAvailable("refused".into())).code,
            FailureCode::ProviderUnavailable
        );
        assert_eq!(
            classify_provider_error(&ProviderError::ApiError("HTTP 403 Forbidden: no".into())).code,
            FailureCode::Unauthorized
        );
        assert_eq!(
            classify_provider_error(&ProviderError::ParseError("missing field".into())).code,
            FailureCode::Unknown
        );
    }
}
