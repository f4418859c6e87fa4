use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;

use crate::credentials::CredentialPool;
use crate::error::{CompletionError, CompletionFailure, ProviderError};
use crate::llm_client::{CompletionProvider, CompletionRequest, Message};
use crate::prompt::PromptBuilder;
use crate::safety::SafetyFilter;
use crate::session::{windowed_history, Role, SessionManager, UserSession};

#[derive(Debug, Clone)]
pub struct CompletionSettings {
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
}

/// Turns one user message into one in-character reply.
///
/// A failed provider call rotates the credential pool once and is reported
/// to the caller; it is never retried inside the same call.
pub struct CompletionOrchestrator {
    provider: Arc<dyn CompletionProvider>,
    credentials: Arc<CredentialPool>,
    prompt: PromptBuilder,
    safety: SafetyFilter,
    sessions: Arc<SessionManager>,
    settings: CompletionSettings,
    rng: Mutex<StdRng>,
}

impl CompletionOrchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        credentials: Arc<CredentialPool>,
        prompt: PromptBuilder,
        safety: SafetyFilter,
        sessions: Arc<SessionManager>,
        settings: CompletionSettings,
        rng: StdRng,
    ) -> Self {
        Self {
            provider,
            credentials,
            prompt,
            safety,
            sessions,
            settings,
            rng: Mutex::new(rng),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialPool> {
        &self.credentials
    }

    /// System turn, then the history window, then the new user turn.
    pub fn build_messages(&self, session: &UserSession, user_text: &str) -> Vec<Message> {
        let instruction = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.prompt.build(
                &session.display_name,
                session.mood,
                session.relationship_tier(),
                &mut *rng,
            )
        };

        let window = windowed_history(session, self.sessions.history_window());
        let mut messages = Vec::with_capacity(window.len() + 2);
        messages.push(Message::system(instruction));
        messages.extend(window.iter().map(|turn| match turn.role {
            Role::User => Message::user(turn.content.clone()),
            Role::Assistant => Message::assistant(turn.content.clone()),
        }));
        messages.push(Message::user(user_text));
        messages
    }

    pub async fn complete(
        &self,
        session: &mut UserSession,
        user_text: &str,
    ) -> Result<String, CompletionError> {
        let messages = self.build_messages(session, user_text);
        let api_key = self.credentials.current()?.to_string();
        let credential_index = self.credentials.active_index();

        let request = CompletionRequest {
            messages,
            api_key,
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let outcome = match tokio::time::timeout(self.settings.timeout, self.provider.complete(request))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout),
        };

        let raw = match outcome {
            Ok(raw) => raw,
            Err(provider_error) => {
                tracing::error!(
                    "Completion failed for user {} on credential {}: {}",
                    session.user_id,
                    credential_index,
                    provider_error
                );
                self.credentials.rotate();
                return Err(provider_error.into());
            }
        };

        let reply = {
            let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            self.safety.filter(&raw, &mut *rng)
        };
        if reply.trim().is_empty() {
            self.credentials.rotate();
            return Err(CompletionError::new(
                CompletionFailure::MalformedResponse,
                "empty reply after filtering",
            ));
        }

        self.sessions.append_exchange(session, user_text, &reply);
        Ok(reply)
    }
}
