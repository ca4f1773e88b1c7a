//! Language-model collaborator contract.
//!
//! The intent parser sends a [`ModelClient`] a system prompt describing the
//! expected JSON plus the user's text, and treats any error, timeout or
//! unparseable answer as "no model configured". `autoloom-orchestrator`
//! ships an OpenAI-compatible implementation; embedders may bring their own.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Provider/model label for logs.
    fn name(&self) -> &str;

    /// Return the raw completion text.
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}
