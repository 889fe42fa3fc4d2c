//! AI collaborator — Gemini via rig-core behind the [`AiProvider`] trait.
//!
//! The router only sees `ask(user, question) -> text`; per-user chat history
//! and reply length bounding live here. Mesh frames are tiny, so replies are
//! capped and trimmed at sentence boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::Chat;
use rig::message::Message;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;

use crate::error::AiError;

/// Hard cap on reply characters (3-4 mesh frames).
const MAX_REPLY_CHARS: usize = 600;

/// Turns of history kept per user (user + assistant messages).
const HISTORY_LIMIT: usize = 20;

const PREAMBLE: &str = "You are a DM bot on a low-bandwidth mesh radio network. \
Strict brevity rules: aim for 250-450 characters, never over 600. \
One compact paragraph or up to three short '-' bullets. \
No greetings, no preamble, no fluff; deliver facts and steps.";

/// Configuration for the AI backend.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl AiConfig {
    /// Build config from environment variables.
    /// Returns `None` if `GEMINI_API_KEY` is not set (AI disabled).
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").ok()?;
        let model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string());
        Some(Self {
            api_key: secrecy::SecretString::from(api_key),
            model,
        })
    }
}

/// Question-answering contract the router dispatches `/ai` through.
#[async_trait]
pub trait AiProvider: Send + Sync {
    async fn ask(&self, user: u32, question: &str) -> Result<String, AiError>;

    fn model_name(&self) -> &str;
}

/// Create an AI provider from configuration.
pub fn create_provider(config: &AiConfig) -> Result<Arc<dyn AiProvider>, AiError> {
    use rig::providers::gemini;

    let client: rig::client::Client<gemini::client::GeminiExt> =
        gemini::Client::new(config.api_key.expose_secret()).map_err(|e| {
            AiError::RequestFailed(format!("failed to create Gemini client: {e}"))
        })?;

    let agent = client.agent(&config.model).preamble(PREAMBLE).build();
    tracing::info!(model = %config.model, "AI backend ready");
    Ok(Arc::new(GeminiProvider {
        agent,
        model: config.model.clone(),
        history: Mutex::new(HashMap::new()),
    }))
}

struct GeminiProvider {
    agent: rig::agent::Agent<rig::providers::gemini::completion::CompletionModel>,
    model: String,
    history: Mutex<HashMap<u32, Vec<Message>>>,
}

#[async_trait]
impl AiProvider for GeminiProvider {
    async fn ask(&self, user: u32, question: &str) -> Result<String, AiError> {
        let history = {
            let guard = self.history.lock().await;
            guard.get(&user).cloned().unwrap_or_default()
        };

        let raw = self
            .agent
            .chat(question, history)
            .await
            .map_err(|e| AiError::RequestFailed(e.to_string()))?;

        let reply = trim_to_chars(&raw, MAX_REPLY_CHARS);
        if reply.is_empty() {
            return Err(AiError::EmptyResponse);
        }

        let mut guard = self.history.lock().await;
        let turns = guard.entry(user).or_default();
        turns.push(Message::user(question));
        turns.push(Message::assistant(reply.clone()));
        if turns.len() > HISTORY_LIMIT {
            let excess = turns.len() - HISTORY_LIMIT;
            turns.drain(..excess);
        }

        Ok(reply)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Trim to at most `max_chars`, preferring a sentence or line boundary.
pub(crate) fn trim_to_chars(s: &str, max_chars: usize) -> String {
    let s = s.trim();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }

    let cutoff = s
        .char_indices()
        .nth(max_chars)
        .map_or(s.len(), |(i, _)| i);
    let head = &s[..cutoff];

    let boundary = [". ", "! ", "? ", "\n"]
        .iter()
        .filter_map(|p| head.rfind(p).map(|i| i + p.trim_end().len()))
        .max();

    match boundary {
        Some(end) => head[..end].trim_end().to_string(),
        None => head.trim_end().to_string(),
    }
}
