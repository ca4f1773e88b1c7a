//! Task registry: maps task-type names to capabilities.
//!
//! Populated before workflows are resolved; the resolver rejects any task
//! whose type is not registered here.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use autoloom_core::error::{AutoloomError, Result};
use autoloom_core::traits::Capability;
use autoloom_core::types::Parameters;

/// Shared, thread-safe capability lookup.
#[derive(Default)]
pub struct TaskRegistry {
    capabilities: RwLock<HashMap<String, Arc<dyn Capability>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with `noop`, `log_message`, `sleep` and `http_get`.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for (name, capability) in builtin_capabilities() {
            // Names are non-empty constants
            let _ = registry.register(name, capability);
        }
        registry
    }

    /// Register (or replace) a capability under `task_type`.
    pub fn register(&self, task_type: &str, capability: Arc<dyn Capability>) -> Result<()> {
        let task_type = task_type.trim();
        if task_type.is_empty() {
            return Err(AutoloomError::config("task type name must not be empty"));
        }
        let replaced = self
            .capabilities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_type.to_string(), capability)
            .is_some();
        if replaced {
            tracing::info!("🔁 Capability replaced: '{task_type}'");
        } else {
            tracing::debug!("🧩 Capability registered: '{task_type}'");
        }
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .capabilities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Check `parameters` against the capability's declared `required` keys.
    pub fn validate_params(&self, task_type: &str, parameters: &Parameters) -> Result<()> {
        let capability = self
            .get(task_type)
            .ok_or_else(|| AutoloomError::not_found(format!("task type '{task_type}'")))?;
        validate_params(task_type, &capability.schema(), parameters)
    }
}

/// Validate that parameters carry every key listed in `schema.required`.
pub fn validate_params(
    task_type: &str,
    schema: &serde_json::Value,
    parameters: &Parameters,
) -> Result<()> {
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for req in required {
            if let Some(key) = req.as_str()
                && !parameters.contains_key(key)
            {
                return Err(AutoloomError::config(format!(
                    "task type '{task_type}' is missing required parameter: {key}"
                )));
            }
        }
    }
    Ok(())
}

fn builtin_capabilities() -> Vec<(&'static str, Arc<dyn Capability>)> {
    vec![
        ("noop", Arc::new(NoopCapability) as Arc<dyn Capability>),
        ("log_message", Arc::new(LogMessageCapability)),
        ("sleep", Arc::new(SleepCapability)),
        ("http_get", Arc::new(HttpGetCapability::new())),
    ]
}

/// Succeeds immediately.
pub struct NoopCapability;

#[async_trait]
impl Capability for NoopCapability {
    fn description(&self) -> &str {
        "Does nothing and succeeds"
    }

    async fn invoke(&self, _parameters: &Parameters) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }
}

/// Writes `message` to the log.
pub struct LogMessageCapability;

#[async_trait]
impl Capability for LogMessageCapability {
    fn description(&self) -> &str {
        "Log a message"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "required": ["message"],
            "properties": { "message": { "type": "string" } }
        })
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value> {
        let message = parameters
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or_default();
        tracing::info!("📢 {message}");
        Ok(serde_json::json!({ "logged": message }))
    }
}

/// Sleeps for `secs` seconds (fractions allowed). Handy as a stand-in for slow work.
pub struct SleepCapability;

#[async_trait]
impl Capability for SleepCapability {
    fn description(&self) -> &str {
        "Sleep for a number of seconds"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "required": ["secs"],
            "properties": { "secs": { "type": "number" } }
        })
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value> {
        let secs = parameters
            .get("secs")
            .and_then(|s| s.as_f64())
            .filter(|s| s.is_finite() && *s >= 0.0)
            .ok_or_else(|| AutoloomError::execution("'secs' must be a non-negative number"))?;
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
        Ok(serde_json::json!({ "slept_secs": secs }))
    }
}

/// GET a URL; non-2xx answers fail the run. Used for webhooks and probes.
pub struct HttpGetCapability {
    client: reqwest::Client,
}

impl HttpGetCapability {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGetCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Capability for HttpGetCapability {
    fn description(&self) -> &str {
        "HTTP GET a URL and report the status code"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({
            "required": ["url"],
            "properties": {
                "url": { "type": "string" },
                "timeout_secs": { "type": "integer" }
            }
        })
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value> {
        let url = parameters
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| AutoloomError::execution("'url' must be a string"))?;
        let timeout = parameters
            .get("timeout_secs")
            .and_then(|t| t.as_u64())
            .unwrap_or(30);

        tracing::info!("🌐 GET {url}");
        let resp = self
            .client
            .get(url)
            .timeout(Duration::from_secs(timeout))
            .send()
            .await
            .map_err(|e| AutoloomError::execution(format!("GET {url} failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(AutoloomError::execution(format!("GET {url} returned {status}")));
        }
        Ok(serde_json::json!({ "url": url, "status": status.as_u16() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloom_core::traits::FnCapability;

    fn params(value: serde_json::Value) -> Parameters {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TaskRegistry::with_builtins();
        assert_eq!(
            registry.task_types(),
            vec!["http_get", "log_message", "noop", "sleep"]
        );
        assert!(registry.contains("noop"));
        assert!(!registry.contains("account_create"));
    }

    #[test]
    fn test_validate_params_missing() {
        let registry = TaskRegistry::with_builtins();
        let err = registry
            .validate_params("http_get", &Parameters::new())
            .unwrap_err();
        assert!(matches!(err, AutoloomError::Config(_)));

        let ok = registry.validate_params("http_get", &params(serde_json::json!({"url": "https://example.com"})));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_validate_params_no_required() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.validate_params("noop", &Parameters::new()).is_ok());
        assert!(matches!(
            registry.validate_params("missing", &Parameters::new()),
            Err(AutoloomError::NotFound(_))
        ));
    }

    #[test]
    fn test_register_rejects_empty_name() {
        let registry = TaskRegistry::new();
        assert!(registry.register("  ", Arc::new(NoopCapability)).is_err());
    }

    #[tokio::test]
    async fn test_register_closure_and_invoke() {
        let registry = TaskRegistry::new();
        registry
            .register(
                "echo",
                Arc::new(FnCapability::new(|p: Parameters| async move {
                    Ok(serde_json::Value::Object(p))
                })),
            )
            .unwrap();
        let out = registry
            .get("echo")
            .unwrap()
            .invoke(&params(serde_json::json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(out["a"], 1);
    }

    #[tokio::test]
    async fn test_sleep_rejects_bad_secs() {
        let err = SleepCapability
            .invoke(&params(serde_json::json!({"secs": "soon"})))
            .await
            .unwrap_err();
        assert!(matches!(err, AutoloomError::Execution(_)));
        assert!(SleepCapability
            .invoke(&params(serde_json::json!({"secs": 0.01})))
            .await
            .is_ok());
    }
}
