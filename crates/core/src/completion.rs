use crate::analytics::ConversationStyle;
use crate::model::{ConversationContext, ConversationMessage, ConversationType, Role};
use crate::prompts::PromptLibrary;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// How the next assistant turn should be phrased.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StyleHints {
    pub style: ConversationStyle,
    /// Recently asked questions the interviewer should not repeat.
    pub avoid_questions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginRequest {
    pub context: Arc<ConversationContext>,
    pub conversation_type: ConversationType,
    pub style_hints: Option<StyleHints>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginResponse {
    pub session_id: String,
    pub assistant_text: String,
    pub goals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinueRequest {
    pub session_id: String,
    pub messages: Vec<ConversationMessage>,
    pub conversation_type: ConversationType,
    pub context: Arc<ConversationContext>,
    pub style_hints: Option<StyleHints>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContinueResponse {
    pub assistant_text: String,
}

#[derive(Debug, Deserialize)]
pub struct LlmResponse {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub content: Option<String>,
}

/// The AI side of a text conversation.
///
/// `begin` opens a session and produces the interviewer's first message;
/// `continue_session` produces the reply to the full message list so far.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn begin(&self, request: BeginRequest) -> Result<BeginResponse>;

    async fn continue_session(&self, request: ContinueRequest) -> Result<ContinueResponse>;
}

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiCompletionClient {
    client: Client,
    api_key: SecretString,
    base_url: String,
    model: String,
    prompts: Arc<PromptLibrary>,
}

impl OpenAiCompletionClient {
    pub fn new(api_key: SecretString, model: String, prompts: Arc<PromptLibrary>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
            model,
            prompts,
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    async fn chat(&self, messages: Vec<serde_json::Value>) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": messages,
        });

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .context("completion request failed")?
            .error_for_status()
            .context("completion service returned an error status")?
            .json::<LlmResponse>()
            .await
            .context("completion response was not valid JSON")?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            return Err(anyhow!("No response from LLM"));
        }
        Ok(content)
    }
}

fn chat_message(role: &str, content: &str) -> serde_json::Value {
    json!({ "role": role, "content": content })
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    async fn begin(&self, request: BeginRequest) -> Result<BeginResponse> {
        let system = self.prompts.system_prompt(
            request.conversation_type,
            &request.context,
            request.style_hints.as_ref(),
        )?;
        let opening = self.prompts.render("opening", &[])?;
        let assistant_text = self
            .chat(vec![
                chat_message("system", &system),
                chat_message("user", &opening),
            ])
            .await?;

        let session_id = Uuid::new_v4().to_string();
        debug!(%session_id, conversation_type = %request.conversation_type, "conversation opened");
        Ok(BeginResponse {
            session_id,
            assistant_text,
            goals: request.conversation_type.goals(),
        })
    }

    async fn continue_session(&self, request: ContinueRequest) -> Result<ContinueResponse> {
        let system = self.prompts.system_prompt(
            request.conversation_type,
            &request.context,
            request.style_hints.as_ref(),
        )?;
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        messages.push(chat_message("system", &system));
        messages.extend(request.messages.iter().map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
            };
            chat_message(role, &m.content)
        }));

        let assistant_text = self.chat(messages).await?;
        debug!(session_id = %request.session_id, "conversation continued");
        Ok(ContinueResponse { assistant_text })
    }
}
