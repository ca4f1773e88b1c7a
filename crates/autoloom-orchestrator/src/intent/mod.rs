//! Intent Parser: free text → candidate task specifications.
//!
//! The parser always calls through an [`IntentSource`]. Which source (pattern
//! rules, or a language model with pattern fallback) is decided once, at
//! construction.

mod model;
mod pattern;

pub use model::{ModelSource, OpenAiCompatibleClient};
pub use pattern::PatternSource;

use std::sync::Arc;

use async_trait::async_trait;
use autoloom_core::config::IntentConfig;
use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::traits::ModelClient;
use autoloom_core::types::TaskSpec;

/// A strategy for turning text into task specs.
#[async_trait]
pub trait IntentSource: Send + Sync {
    fn name(&self) -> &str;

    /// Extract tasks. An empty list means "nothing recognised".
    async fn extract(&self, text: &str) -> Result<Vec<TaskSpec>>;
}

/// Stateless front door for intent extraction.
pub struct IntentParser {
    source: Box<dyn IntentSource>,
}

impl IntentParser {
    pub fn new(source: Box<dyn IntentSource>) -> Self {
        Self { source }
    }

    /// Deterministic pattern rules only.
    pub fn pattern(config: &IntentConfig) -> Result<Self> {
        Ok(Self::new(Box::new(PatternSource::new(config.default_hour)?)))
    }

    /// Model first, pattern rules on any model failure.
    pub fn with_model(client: Arc<dyn ModelClient>, config: &IntentConfig) -> Result<Self> {
        Ok(Self::new(Box::new(ModelSource::new(client, config)?)))
    }

    /// Model-backed when an endpoint is configured, pattern-backed otherwise.
    pub fn from_config(config: &IntentConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Self::pattern(config);
        }
        let client = OpenAiCompatibleClient::from_config(config);
        tracing::info!("🧠 Intent parser using model '{}'", config.model);
        Self::with_model(Arc::new(client), config)
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Parse `text` into task specs.
    ///
    /// Fails with a parse error only when the text is blank or no task is recognised.
    pub async fn parse(&self, text: &str) -> Result<Vec<TaskSpec>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(AutoloomError::parse("intent text is empty"));
        }
        let tasks = self.source.extract(text).await?;
        if tasks.is_empty() {
            return Err(AutoloomError::parse(format!("no recognisable task in: \"{text}\"")));
        }
        tracing::debug!("🔎 {} extracted {} task(s)", self.source.name(), tasks.len());
        Ok(tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloom_core::types::TriggerSpec;

    fn parser() -> IntentParser {
        IntentParser::pattern(&IntentConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_blank_text_is_parse_error() {
        for text in ["", "   \n\t"] {
            assert!(matches!(parser().parse(text).await, Err(AutoloomError::Parse(_))));
        }
    }

    #[tokio::test]
    async fn test_unrecognised_text_is_parse_error() {
        let err = parser().parse("bake a cake").await.unwrap_err();
        assert!(matches!(err, AutoloomError::Parse(_)));
    }

    #[tokio::test]
    async fn test_daily_twitter_accounts() {
        let tasks = parser()
            .parse("every day at 9 AM create 5 twitter accounts")
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.task_type, "account_create");
        assert_eq!(task.trigger, Some(TriggerSpec::cron("0 9 * * *")));
        assert_eq!(task.parameters["platform"], "twitter");
        assert_eq!(task.parameters["count"], 5);
        assert!(task.depends_on.is_empty());
    }

    #[test]
    fn test_from_config_without_endpoint_is_pattern_backed() {
        let parser = IntentParser::from_config(&IntentConfig::default()).unwrap();
        assert_eq!(parser.source_name(), "pattern");
    }
}
