//! Conversation handler: `/start`, join verification and plain text.
//!
//! Every failure below this layer is turned into one short in-character line
//! here; raw errors only reach the logs and the event feed.

use std::sync::Arc;

use chrono::Utc;
use regex_lite::Regex;

use crate::config::BotMessages;
use crate::events::{BotEvent, EventSink};
use crate::gatekeeper::Gatekeeper;
use crate::orchestrator::CompletionOrchestrator;
use crate::session::{SessionManager, UserSession};
use crate::transport::{ChatTransport, InlineButton};

pub const VERIFY_JOIN: &str = "verify_join";

/// Platform-neutral inbound update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Command {
        user_id: i64,
        display_name: String,
        chat_id: i64,
        name: String,
    },
    Text {
        user_id: i64,
        display_name: String,
        chat_id: i64,
        text: String,
    },
    Callback {
        callback_id: String,
        user_id: i64,
        display_name: String,
        chat_id: i64,
        /// The prompt the button was attached to; absent for inline-mode callbacks.
        message_id: Option<i64>,
        data: String,
    },
}

#[derive(Debug, Clone)]
pub struct ChatBotOptions {
    pub messages: BotMessages,
    pub channel_url: String,
    pub strict_membership: bool,
}

pub struct ChatBot {
    transport: Arc<dyn ChatTransport>,
    gatekeeper: Gatekeeper,
    sessions: Arc<SessionManager>,
    orchestrator: Arc<CompletionOrchestrator>,
    messages: BotMessages,
    channel_url: String,
    strict_membership: bool,
    farewell: Option<Regex>,
    events: EventSink,
}

/// Case-insensitive, word-bounded alternation over the farewell keywords.
fn farewell_pattern(keywords: &[String]) -> Option<Regex> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|keyword| keyword.trim())
        .filter(|keyword| !keyword.is_empty())
        .map(|keyword| {
            keyword
                .split_whitespace()
                .map(regex_lite::escape)
                .collect::<Vec<_>>()
                .join(r"\s+")
        })
        .collect();
    if alternatives.is_empty() {
        return None;
    }
    let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
    match Regex::new(&pattern) {
        Ok(regex) => Some(regex),
        Err(e) => {
            tracing::error!("Invalid farewell keyword pattern, disabling farewells: {}", e);
            None
        }
    }
}

impl ChatBot {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        gatekeeper: Gatekeeper,
        sessions: Arc<SessionManager>,
        orchestrator: Arc<CompletionOrchestrator>,
        options: ChatBotOptions,
        events: EventSink,
    ) -> Self {
        let farewell = farewell_pattern(&options.messages.farewell_keywords);
        Self {
            transport,
            gatekeeper,
            sessions,
            orchestrator,
            messages: options.messages,
            channel_url: options.channel_url,
            strict_membership: options.strict_membership,
            farewell,
            events,
        }
    }

    pub fn is_farewell(&self, text: &str) -> bool {
        self.farewell
            .as_ref()
            .map(|regex| regex.is_match(text))
            .unwrap_or(false)
    }

    pub async fn handle(&self, event: InboundEvent) {
        match event {
            InboundEvent::Command {
                user_id,
                display_name,
                chat_id,
                name,
            } => {
                if name == "start" {
                    self.handle_start(user_id, &display_name, chat_id).await;
                } else {
                    tracing::debug!("Ignoring unknown command /{} from user {}", name, user_id);
                }
            }
            InboundEvent::Callback {
                callback_id,
                user_id,
                chat_id,
                message_id,
                data,
                ..
            } => {
                self.handle_callback(&callback_id, user_id, chat_id, message_id, &data)
                    .await;
            }
            InboundEvent::Text {
                user_id,
                display_name,
                chat_id,
                text,
            } => {
                self.handle_text(user_id, &display_name, chat_id, &text).await;
            }
        }
    }

    async fn handle_start(&self, user_id: i64, display_name: &str, chat_id: i64) {
        self.sessions.get_or_create(user_id, display_name);

        if self.gatekeeper.is_member(user_id).await {
            self.events.emit(BotEvent::AccessGranted { user_id });
            self.send(chat_id, &self.messages.welcome).await;
        } else {
            self.send_join_prompt(user_id, display_name, chat_id).await;
        }
    }

    async fn send_join_prompt(&self, user_id: i64, display_name: &str, chat_id: i64) {
        self.events.emit(BotEvent::AccessDenied { user_id });
        let text = self.messages.join_prompt.replace("{name}", display_name);
        let buttons = [
            InlineButton::Url {
                label: self.messages.join_button.clone(),
                url: self.channel_url.clone(),
            },
            InlineButton::Callback {
                label: self.messages.verify_button.clone(),
                data: VERIFY_JOIN.to_string(),
            },
        ];
        if let Err(e) = self
            .transport
            .send_with_buttons(chat_id, &text, &buttons)
            .await
        {
            tracing::warn!("Failed to send join prompt to chat {}: {:#}", chat_id, e);
        }
    }

    async fn handle_callback(
        &self,
        callback_id: &str,
        user_id: i64,
        chat_id: i64,
        message_id: Option<i64>,
        data: &str,
    ) {
        if let Err(e) = self.transport.answer_callback(callback_id).await {
            tracing::debug!("Failed to answer callback {}: {:#}", callback_id, e);
        }
        if data != VERIFY_JOIN {
            tracing::debug!("Ignoring callback data {:?} from user {}", data, user_id);
            return;
        }

        if self.gatekeeper.is_member(user_id).await {
            self.events.emit(BotEvent::AccessGranted { user_id });
            if let Some(message_id) = message_id {
                if let Err(e) = self.transport.delete_message(chat_id, message_id).await {
                    tracing::debug!("Failed to delete join prompt {}: {:#}", message_id, e);
                }
            }
            self.send(chat_id, &self.messages.welcome_back).await;
        } else {
            self.events.emit(BotEvent::AccessDenied { user_id });
            self.send(chat_id, &self.messages.verify_failed).await;
        }
    }

    async fn handle_text(&self, user_id: i64, display_name: &str, chat_id: i64, text: &str) {
        if self.strict_membership && !self.gatekeeper.is_member(user_id).await {
            self.send_join_prompt(user_id, display_name, chat_id).await;
            return;
        }

        let mut session = match self.sessions.find(user_id) {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::info!("First message from unknown user {}, running /start", user_id);
                self.handle_start(user_id, display_name, chat_id).await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    "Session store unavailable for user {}, continuing with defaults: {:#}",
                    user_id,
                    e
                );
                self.sessions.detached_default(user_id, display_name)
            }
        };

        let mood = self.sessions.record_inbound(&mut session, text, Utc::now());
        self.events.emit(BotEvent::MessageReceived { user_id, mood });

        if self.is_farewell(text) {
            self.send(chat_id, &self.messages.good_night).await;
            self.events.emit(BotEvent::FarewellSent { user_id });
            return;
        }

        if let Err(e) = self.transport.send_typing(chat_id).await {
            tracing::debug!("Typing indicator failed for chat {}: {:#}", chat_id, e);
        }

        self.reply(&mut session, chat_id, text).await;
    }

    async fn reply(&self, session: &mut UserSession, chat_id: i64, text: &str) {
        let user_id = session.user_id;
        match self.orchestrator.complete(session, text).await {
            Ok(reply) => {
                self.send(chat_id, &reply).await;
                self.events.emit(BotEvent::ReplySent { user_id });
            }
            Err(e) => {
                tracing::warn!("No reply for user {}: {}", user_id, e);
                self.events.emit(BotEvent::CompletionFailed {
                    user_id,
                    reason: e.reason,
                    active_credential: self.orchestrator.credentials().active_index(),
                });
                self.send(chat_id, &self.messages.connectivity_trouble).await;
            }
        }
    }

    async fn send(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.transport.send_text(chat_id, text).await {
            tracing::warn!("Failed to send message to chat {}: {:#}", chat_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use crate::config::{MoodConfig, PersonaConfig, SafetyConfig};
    use crate::credentials::CredentialPool;
    use crate::error::ProviderError;
    use crate::orchestrator::CompletionSettings;
    use crate::prompt::PromptBuilder;
    use crate::safety::SafetyFilter;
    use crate::session::{Mood, MoodLexicon};
    use crate::store::sqlite::SqliteSessionStore;
    use crate::store::SessionStore;
    use crate::test_support::{FailingStore, FakeProvider, FakeTransport, Sent};

    struct Harness {
        bot: ChatBot,
        transport: Arc<FakeTransport>,
        provider: Arc<FakeProvider>,
        sessions: Arc<SessionManager>,
        orchestrator: Arc<CompletionOrchestrator>,
        events: flume::Receiver<BotEvent>,
    }

    fn harness(provider: FakeProvider, keys: &[&str], strict_membership: bool) -> Harness {
        let store = SqliteSessionStore::open_in_memory().expect("store");
        harness_over(Arc::new(store), provider, keys, strict_membership)
    }

    fn harness_over(
        store: Arc<dyn SessionStore>,
        provider: FakeProvider,
        keys: &[&str],
        strict_membership: bool,
    ) -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let provider = Arc::new(provider);
        let sessions = Arc::new(SessionManager::new(
            store,
            MoodLexicon::from_config(&MoodConfig::default()),
            Mood::Warm,
            8,
        ));
        let orchestrator = Arc::new(CompletionOrchestrator::new(
            provider.clone(),
            Arc::new(CredentialPool::new(keys.iter().copied())),
            PromptBuilder::new(PersonaConfig {
                playful_probability: 0.0,
                ..PersonaConfig::default()
            }),
            SafetyFilter::from_config(&SafetyConfig::default()),
            sessions.clone(),
            CompletionSettings {
                max_tokens: 150,
                temperature: 1.0,
                timeout: Duration::from_secs(5),
            },
            StdRng::seed_from_u64(3),
        ));
        let (sink, events) = crate::events::channel();
        let bot = ChatBot::new(
            transport.clone(),
            Gatekeeper::new(transport.clone(), "@riya_channel"),
            sessions.clone(),
            orchestrator.clone(),
            ChatBotOptions {
                messages: BotMessages::default(),
                channel_url: "https://t.me/riya_channel".to_string(),
                strict_membership,
            },
            sink,
        );
        Harness {
            bot,
            transport,
            provider,
            sessions,
            orchestrator,
            events,
        }
    }

    fn start(user_id: i64) -> InboundEvent {
        InboundEvent::Command {
            user_id,
            display_name: "Aman".to_string(),
            chat_id: user_id,
            name: "start".to_string(),
        }
    }

    fn text(user_id: i64, body: &str) -> InboundEvent {
        InboundEvent::Text {
            user_id,
            display_name: "Aman".to_string(),
            chat_id: user_id,
            text: body.to_string(),
        }
    }

    fn verify(user_id: i64, message_id: i64) -> InboundEvent {
        InboundEvent::Callback {
            callback_id: "cb-1".to_string(),
            user_id,
            display_name: "Aman".to_string(),
            chat_id: user_id,
            message_id: Some(message_id),
            data: VERIFY_JOIN.to_string(),
        }
    }

    #[tokio::test]
    async fn new_non_member_is_prompted_then_welcomed_after_verifying() {
        let h = harness(FakeProvider::replying(["hii"]), &["k0"], false);

        h.bot.handle(start(1)).await;
        match h.transport.sent().as_slice() {
            [Sent::Buttons { chat_id, text, buttons }] => {
                assert_eq!(*chat_id, 1);
                assert!(text.starts_with("Hii Aman!"));
                assert_eq!(buttons.len(), 2);
                assert!(matches!(&buttons[0], InlineButton::Url { url, .. } if url == "https://t.me/riya_channel"));
                assert!(matches!(&buttons[1], InlineButton::Callback { data, .. } if data == VERIFY_JOIN));
            }
            other => panic!("unexpected sends {:?}", other),
        }

        let session = h.sessions.find(1).unwrap().expect("session created");
        assert_eq!(session.mood, Mood::Warm);
        assert!(session.history.is_empty());

        h.transport.make_member(1);
        h.bot.handle(verify(1, 55)).await;
        let sent = h.transport.sent();
        assert_eq!(
            sent[1..].to_vec(),
            vec![
                Sent::CallbackAnswered {
                    callback_id: "cb-1".to_string()
                },
                Sent::Deleted {
                    chat_id: 1,
                    message_id: 55
                },
                Sent::Text {
                    chat_id: 1,
                    text: BotMessages::default().welcome_back
                },
            ]
        );
    }

    #[tokio::test]
    async fn verify_without_prompt_message_is_still_answered() {
        let h = harness(FakeProvider::replying(["hii"]), &["k0"], false);
        h.transport.make_member(6);
        h.bot
            .handle(InboundEvent::Callback {
                callback_id: "cb-inline".to_string(),
                user_id: 6,
                display_name: "Aman".to_string(),
                chat_id: 6,
                message_id: None,
                data: VERIFY_JOIN.to_string(),
            })
            .await;
        assert_eq!(
            h.transport.sent(),
            vec![
                Sent::CallbackAnswered {
                    callback_id: "cb-inline".to_string()
                },
                Sent::Text {
                    chat_id: 6,
                    text: BotMessages::default().welcome_back
                },
            ]
        );
    }

    #[tokio::test]
    async fn store_outage_still_gets_a_reply() {
        let h = harness_over(
            Arc::new(FailingStore),
            FakeProvider::replying(["haan bolo"]),
            &["k0"],
            false,
        );
        h.transport.make_member(12);
        h.bot.handle(text(12, "kaisi ho")).await;

        assert_eq!(h.transport.texts_to(12), vec!["haan bolo".to_string()]);
        assert!(h
            .transport
            .sent()
            .contains(&Sent::Typing { chat_id: 12 }));

        let requests = h.provider.requests();
        assert_eq!(requests.len(), 1);
        // Detached default: system turn plus the new user turn, no stored history.
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[1].content, "kaisi ho");
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, BotEvent::ReplySent { user_id: 12 })));
    }

    #[tokio::test]
    async fn failed_verification_reproaches_and_keeps_prompt() {
        let h = harness(FakeProvider::replying(["hii"]), &["k0"], false);
        h.bot.handle(verify(2, 9)).await;
        let sent = h.transport.sent();
        assert!(!sent.iter().any(|s| matches!(s, Sent::Deleted { .. })));
        assert_eq!(h.transport.texts_to(2), vec![BotMessages::default().verify_failed]);
    }

    #[tokio::test]
    async fn member_start_gets_welcome() {
        let h = harness(FakeProvider::replying(["hii"]), &["k0"], false);
        h.transport.make_member(3);
        h.bot.handle(start(3)).await;
        assert_eq!(h.transport.texts_to(3), vec![BotMessages::default().welcome]);
    }

    #[tokio::test]
    async fn hostile_message_angers_and_apology_calms() {
        let h = harness(FakeProvider::replying(["hmm", "acha theek hai"]), &["k0"], false);
        h.transport.make_member(4);
        h.bot.handle(start(4)).await;

        h.bot.handle(text(4, "you are so bakwas")).await;
        assert_eq!(h.sessions.find(4).unwrap().unwrap().mood, Mood::Angry);

        h.bot.handle(text(4, "sorry")).await;
        assert_eq!(h.sessions.find(4).unwrap().unwrap().mood, Mood::Warm);

        let requests = h.provider.requests();
        assert!(requests[0].messages[0].content.contains("Current Mood: angry"));
        assert!(requests[1].messages[0].content.contains("Current Mood: warm"));
        assert_eq!(h.transport.texts_to(4)[1..], ["hmm", "acha theek hai"]);
    }

    #[tokio::test]
    async fn provider_timeout_rotates_and_user_sees_fixed_apology() {
        let h = harness(FakeProvider::failing(ProviderError::Timeout), &["k0", "k1", "k2"], false);
        h.transport.make_member(5);
        h.bot.handle(start(5)).await;

        h.bot.handle(text(5, "kya kar rahi ho")).await;
        assert_eq!(h.orchestrator.credentials().active_index(), 1);
        assert_eq!(
            h.transport.texts_to(5).last().unwrap(),
            &BotMessages::default().connectivity_trouble
        );
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, BotEvent::CompletionFailed { user_id: 5, active_credential: 1, .. })));
    }

    #[tokio::test]
    async fn farewell_keyword_short_circuits_completion() {
        let h = harness(FakeProvider::replying(["reply"]), &["k0"], false);
        h.transport.make_member(6);
        h.bot.handle(start(6)).await;

        h.bot.handle(text(6, "ok GN")).await;
        assert!(h.provider.requests().is_empty());
        assert_eq!(
            h.transport.texts_to(6).last().unwrap(),
            &BotMessages::default().good_night
        );
        assert!(h.sessions.find(6).unwrap().unwrap().history.is_empty());
    }

    #[test]
    fn farewell_matching_respects_word_boundaries() {
        let h = harness(FakeProvider::replying(["x"]), &["k0"], false);
        assert!(h.bot.is_farewell("chalo bye"));
        assert!(h.bot.is_farewell("Good   Night baby"));
        assert!(h.bot.is_farewell("gn!"));
        assert!(!h.bot.is_farewell("gnome dekha?"));
        assert!(!h.bot.is_farewell("byeee"));
        assert!(!h.bot.is_farewell("kaisi ho"));
    }

    #[tokio::test]
    async fn first_text_from_unknown_user_runs_start() {
        let h = harness(FakeProvider::replying(["reply"]), &["k0"], false);
        h.bot.handle(text(7, "hello")).await;
        assert!(h.provider.requests().is_empty());
        assert!(matches!(h.transport.sent().as_slice(), [Sent::Buttons { .. }]));
        assert!(h.sessions.find(7).unwrap().is_some());
    }

    #[tokio::test]
    async fn strict_mode_blocks_non_members_every_message() {
        let h = harness(FakeProvider::replying(["reply"]), &["k0"], true);
        h.transport.make_member(8);
        h.bot.handle(start(8)).await;
        h.transport.set_status(8, crate::transport::MembershipStatus::Left);

        h.bot.handle(text(8, "hi")).await;
        assert!(h.provider.requests().is_empty());
        assert!(matches!(h.transport.sent().last(), Some(Sent::Buttons { .. })));
    }

    #[tokio::test]
    async fn successful_reply_is_sent_after_typing_and_recorded() {
        let h = harness(FakeProvider::replying(["main theek hu"]), &["k0"], false);
        h.transport.make_member(9);
        h.bot.handle(start(9)).await;
        h.bot.handle(text(9, "kaisi ho")).await;

        let sent = h.transport.sent();
        assert_eq!(sent[sent.len() - 2], Sent::Typing { chat_id: 9 });
        assert_eq!(
            sent[sent.len() - 1],
            Sent::Text {
                chat_id: 9,
                text: "main theek hu".to_string()
            }
        );
        assert_eq!(h.sessions.find(9).unwrap().unwrap().history.len(), 2);
        assert!(h
            .events
            .try_iter()
            .any(|e| matches!(e, BotEvent::ReplySent { user_id: 9 })));
    }

    #[tokio::test]
    async fn unreachable_chat_does_not_panic() {
        let h = harness(FakeProvider::replying(["x"]), &["k0"], false);
        h.transport.make_member(10);
        h.bot.handle(start(10)).await;
        h.transport.fail_sends_to(10);
        h.bot.handle(text(10, "hi")).await;
        assert_eq!(h.sessions.find(10).unwrap().unwrap().history.len(), 2);
    }
}
