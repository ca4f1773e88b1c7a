//! Language-model intent source with pattern fallback.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoloom_core::config::IntentConfig;
use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::traits::ModelClient;
use autoloom_core::types::{Parameters, TaskSpec, TriggerSpec};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{IntentSource, PatternSource};

const SYSTEM_PROMPT: &str = r#"You turn a description of automation work into tasks.
Answer with JSON only, no prose, matching:
{"tasks": [{
  "name": "unique_snake_case_name",
  "task_type": "account_create | data_scrape | browser_navigate | health_check | cleanup",
  "parameters": {"platform": "...", "count": 1, "url": "..."},
  "depends_on": ["name of an earlier task"],
  "schedule": {"cron": "MIN HOUR DOM MON DOW"} | {"interval_secs": 3600} | null
}]}
Cron is evaluated in UTC. Omit parameters that the text does not mention."#;

#[derive(Debug, Deserialize)]
struct ModelAnswer {
    #[serde(default)]
    tasks: Vec<ModelTask>,
}

#[derive(Debug, Deserialize)]
struct ModelTask {
    name: String,
    task_type: String,
    #[serde(default)]
    parameters: Parameters,
    #[serde(default)]
    depends_on: BTreeSet<String>,
    #[serde(default)]
    schedule: Option<ModelSchedule>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelSchedule {
    Cron { cron: String },
    Interval { interval_secs: u64 },
}

impl From<ModelTask> for TaskSpec {
    fn from(task: ModelTask) -> Self {
        let mut spec = TaskSpec::new(task.name.trim(), task.task_type.trim());
        spec.parameters = task.parameters;
        spec.depends_on = task.depends_on;
        spec.trigger = task.schedule.map(|s| match s {
            ModelSchedule::Cron { cron } => TriggerSpec::cron(cron.trim()),
            ModelSchedule::Interval { interval_secs } => TriggerSpec::interval(interval_secs),
        });
        spec
    }
}

/// Pull the JSON object out of a completion that may be wrapped in prose or fences.
fn parse_answer(raw: &str) -> Result<Vec<TaskSpec>> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let body = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => return Err(AutoloomError::parse("model answer contains no JSON object")),
    };
    let answer: ModelAnswer = serde_json::from_str(body)?;
    Ok(answer
        .tasks
        .into_iter()
        .filter(|t| !t.name.trim().is_empty() && !t.task_type.trim().is_empty())
        .map(TaskSpec::from)
        .collect())
}

/// Asks a [`ModelClient`] first; any failure falls through to pattern rules.
pub struct ModelSource {
    client: Arc<dyn ModelClient>,
    timeout: Duration,
    fallback: PatternSource,
}

impl ModelSource {
    pub fn new(client: Arc<dyn ModelClient>, config: &IntentConfig) -> Result<Self> {
        Ok(Self {
            client,
            timeout: Duration::from_secs(config.model_timeout_secs.max(1)),
            fallback: PatternSource::new(config.default_hour)?,
        })
    }

    async fn ask_model(&self, text: &str) -> Result<Vec<TaskSpec>> {
        let raw = tokio::time::timeout(self.timeout, self.client.complete(SYSTEM_PROMPT, text))
            .await
            .map_err(|_| {
                AutoloomError::parse(format!(
                    "model '{}' did not answer within {}s",
                    self.client.name(),
                    self.timeout.as_secs()
                ))
            })??;
        parse_answer(&raw)
    }
}

#[async_trait]
impl IntentSource for ModelSource {
    fn name(&self) -> &str {
        "model"
    }

    async fn extract(&self, text: &str) -> Result<Vec<TaskSpec>> {
        match self.ask_model(text).await {
            Ok(tasks) if !tasks.is_empty() => Ok(tasks),
            Ok(_) => {
                tracing::info!("🧠 Model found no tasks, using pattern rules");
                self.fallback.extract_tasks(text)
            }
            Err(e) => {
                tracing::warn!("⚠️ Model intent extraction failed ({e}), using pattern rules");
                self.fallback.extract_tasks(text)
            }
        }
    }
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatibleClient {
    base_url: String,
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(base_url: &str, model: &str, api_key: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// API key: `intent.api_key` > `AUTOLOOM_API_KEY` > none.
    pub fn from_config(config: &IntentConfig) -> Self {
        let api_key = if config.api_key.is_empty() {
            std::env::var("AUTOLOOM_API_KEY").unwrap_or_default()
        } else {
            config.api_key.clone()
        };
        Self::new(&config.endpoint, &config.model, &api_key)
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
        });
        let url = format!("{}/chat/completions", self.base_url);
        let mut req = self.client.post(&url).json(&body);
        if !self.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", self.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| AutoloomError::parse(format!("model request to {url} failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(AutoloomError::parse(format!("model API error {status}: {text}")));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| AutoloomError::parse(format!("model response unreadable: {e}")))?;
        json["choices"][0]["message"]["content"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| AutoloomError::parse("no content in model response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        answer: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl ModelClient for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
            tokio::time::sleep(self.delay).await;
            self.answer
                .clone()
                .ok_or_else(|| AutoloomError::parse("transport down"))
        }
    }

    fn source(answer: Option<&str>, delay: Duration) -> ModelSource {
        let config = IntentConfig {
            model_timeout_secs: 1,
            ..Default::default()
        };
        let client = Scripted {
            answer: answer.map(String::from),
            delay,
        };
        ModelSource::new(Arc::new(client), &config).unwrap()
    }

    #[tokio::test]
    async fn test_model_answer_used() {
        let answer = r#"Sure! ```json
        {"tasks": [
          {"name": "signup", "task_type": "account_create",
           "parameters": {"platform": "github", "count": 2},
           "schedule": {"cron": "30 8 * * *"}},
          {"name": "crawl", "task_type": "data_scrape",
           "parameters": {"url": "https://example.com"},
           "depends_on": ["signup"], "schedule": null}
        ]}
        ```"#;
        let tasks = source(Some(answer), Duration::ZERO)
            .extract("whatever")
            .await
            .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].trigger, Some(TriggerSpec::cron("30 8 * * *")));
        assert_eq!(tasks[0].parameters["count"], 2);
        assert!(tasks[1].depends_on.contains("signup"));
        assert_eq!(tasks[1].trigger, None);
    }

    #[tokio::test]
    async fn test_interval_schedule_shape() {
        let answer = r#"{"tasks": [{"name": "probe", "task_type": "health_check",
                          "schedule": {"interval_secs": 600}}]}"#;
        let tasks = source(Some(answer), Duration::ZERO).extract("x").await.unwrap();
        assert_eq!(tasks[0].trigger, Some(TriggerSpec::interval(600)));
    }

    #[tokio::test]
    async fn test_falls_back_on_garbage_error_and_empty() {
        let text = "every day at 9 AM create 5 twitter accounts";
        for answer in [Some("I cannot help with that"), None, Some(r#"{"tasks": []}"#)] {
            let tasks = source(answer, Duration::ZERO).extract(text).await.unwrap();
            assert_eq!(tasks.len(), 1, "{answer:?}");
            assert_eq!(tasks[0].parameters["platform"], "twitter");
        }
    }

    #[tokio::test]
    async fn test_falls_back_on_timeout() {
        let tasks = source(Some(r#"{"tasks": []}"#), Duration::from_secs(5))
            .extract("daily cleanup")
            .await
            .unwrap();
        assert_eq!(tasks[0].task_type, "cleanup");
    }
}
