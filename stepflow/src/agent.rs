//! Agent transport
//!
//! The executor sends rendered prompts through [`AgentTransport`] and gets raw
//! text back. [`OllamaAgent`] talks to a local Ollama server.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage},
    Ollama,
};

/// Where a prompt comes from; passed along with every invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationMetadata {
    pub run_id: String,
    pub workflow_name: String,
    pub step_name: String,
    pub run_dir: PathBuf,
}

/// Trait for agent backends
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Send a prompt and return the agent's raw answer
    async fn invoke(&self, prompt: &str, metadata: &InvocationMetadata) -> Result<String>;
}

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 11434;

/// Ollama-backed agent
pub struct OllamaAgent {
    client: Ollama,
    model: String,
    system_prompt: Option<String>,
}

impl OllamaAgent {
    /// Create a new Ollama agent
    pub fn new(url: &str, model: &str) -> Self {
        let (host, port) = match url::Url::parse(url) {
            Ok(url) => (
                url.host_str().unwrap_or(DEFAULT_HOST).to_string(),
                url.port().unwrap_or(DEFAULT_PORT),
            ),
            Err(e) => {
                tracing::warn!("Invalid Ollama URL '{}' ({}), using default", url, e);
                (DEFAULT_HOST.to_string(), DEFAULT_PORT)
            }
        };

        Self {
            client: Ollama::new(format!("http://{}", host), port),
            model: model.to_string(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl AgentTransport for OllamaAgent {
    async fn invoke(&self, prompt: &str, metadata: &InvocationMetadata) -> Result<String> {
        tracing::debug!(
            "Invoking {} for {}/{} ({} chars)",
            self.model,
            metadata.workflow_name,
            metadata.step_name,
            prompt.len()
        );

        let mut messages = Vec::new();
        if let Some(system) = &self.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        messages.push(ChatMessage::user(prompt.to_string()));

        let request = ChatMessageRequest::new(self.model.clone(), messages);
        let response = self.client.send_chat_messages(request).await?;

        Ok(response.message.content)
    }
}
