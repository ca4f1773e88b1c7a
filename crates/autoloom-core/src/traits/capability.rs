//! Capability trait: the work a task type refers to.
//!
//! Browser navigation, CAPTCHA solving, account creation and friends live
//! outside Autoloom; they plug in by implementing [`Capability`] and being
//! registered under a task-type name.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::Parameters;

#[async_trait]
pub trait Capability: Send + Sync {
    /// One-line description for listings.
    fn description(&self) -> &str {
        ""
    }

    /// Parameter schema: `{"required": [...], "properties": {...}}`.
    fn schema(&self) -> serde_json::Value {
        serde_json::json!({})
    }

    /// Do the work. Errors become failed execution records.
    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value>;
}

type BoxFuture = Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send>>;
type BoxedFn = dyn Fn(Parameters) -> BoxFuture + Send + Sync;

/// Adapts an async closure into a [`Capability`].
///
/// ```ignore
/// let cap = FnCapability::new(|params| async move {
///     Ok(serde_json::json!({"echo": params}))
/// });
/// ```
pub struct FnCapability {
    func: Arc<BoxedFn>,
    description: String,
    schema: serde_json::Value,
}

impl FnCapability {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        Self {
            func: Arc::new(move |params| -> BoxFuture { Box::pin(func(params)) }),
            description: String::new(),
            schema: serde_json::json!({}),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.schema = schema;
        self
    }
}

#[async_trait]
impl Capability for FnCapability {
    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> serde_json::Value {
        self.schema.clone()
    }

    async fn invoke(&self, parameters: &Parameters) -> Result<serde_json::Value> {
        (self.func)(parameters.clone()).await
    }
}
