// Development stand-ins for the external capabilities. Real adapters
// (ollama, remote APIs, a container daemon) plug in through the same traits
// from outside this crate.

use anyhow::Result;
use async_trait::async_trait;

use workflow_engine::{ChatCompletion, ChatMessage, ChatOutcome};

/// Chat adapter used when no model back-end is configured: answers every
/// prompt by restating the request, so workflows stay drivable end-to-end.
#[derive(Debug, Default)]
pub struct EchoChat;

#[async_trait]
impl ChatCompletion for EchoChat {
    async fn complete(&self, _model: &str, messages: &[ChatMessage]) -> Result<ChatOutcome> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("(empty)");
        Ok(ChatOutcome {
            content: format!("Acknowledged. Prepared change for: {last_user}"),
            tokens_used: (last_user.len() / 4) as u64,
        })
    }
}
