//! LLM-backed worker that classifies user messages.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use super::worker::{AnalysisResult, UserMessage, Worker};
use crate::error::{Error, Result};
use crate::providers::{execute_with_contract, ExecutionContract, Provider};

const PROMPT_TEMPLATE: &str = r#"You triage messages sent to a support team.
Classify the message below and answer with a single JSON object:
{"intent": "...", "urgency": "critical|high|medium|low", "action": "...", "confidence": 0.0-1.0, "summary": "..."}

intent is one of: question, bug, feedback, help, other.
action is one of: answer, escalate, provide_help, acknowledge.

Sender: {user}
Channel: {channel}
Message:
{content}
"#;

pub struct ClassifierWorker {
    id: String,
    provider: Arc<dyn Provider>,
    model: Option<String>,
    contract: ExecutionContract,
}

impl ClassifierWorker {
    pub fn new(
        id: impl Into<String>,
        provider: Arc<dyn Provider>,
        model: Option<String>,
        contract: ExecutionContract,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            model,
            contract,
        }
    }

    fn prompt(message: &UserMessage) -> String {
        PROMPT_TEMPLATE
            .replace("{user}", &message.user_id)
            .replace("{channel}", &message.channel)
            .replace("{content}", &message.content)
    }
}

#[async_trait]
impl Worker for ClassifierWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn process(&self, message: &UserMessage) -> Result<AnalysisResult> {
        let output = execute_with_contract(
            self.provider.clone(),
            &Self::prompt(message),
            self.model.as_deref(),
            &self.contract,
        )
        .await
        .map_err(|e| Error::Processing(format!("{} via {}: {}", self.id, self.provider.name(), e)))?;

        Ok(parse_analysis(&output))
    }
}

/// Outermost `{...}` span, compiled once.
fn object_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?s)\{.*\}"))
        .as_ref()
        .map_err(|e| Error::Analysis(e.to_string()))
}

fn extract_object(output: &str) -> Result<Value> {
    let found = object_pattern()?
        .find(output)
        .ok_or_else(|| Error::Analysis("no JSON object in model output".to_string()))?;

    let value: Value = serde_json::from_str(found.as_str())
        .map_err(|e| Error::Analysis(format!("unparseable model output: {}", e)))?;
    if !value.is_object() {
        return Err(Error::Analysis("model output is not an object".to_string()));
    }
    Ok(value)
}

/// Read a classification out of model output.
///
/// Output without a JSON object is logged as an analysis error and replaced
/// by the defaults; missing fields are defaulted individually.
pub fn parse_analysis(output: &str) -> AnalysisResult {
    match extract_object(output) {
        Ok(value) => AnalysisResult::from_value(&value),
        Err(e) => {
            tracing::warn!("{}, using defaults", e);
            AnalysisResult::default()
        }
    }
}
