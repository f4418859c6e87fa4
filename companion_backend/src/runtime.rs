use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;

use crate::bot::{ChatBot, ChatBotOptions};
use crate::config::BotConfig;
use crate::credentials::CredentialPool;
use crate::events::{BotEvent, EventSink};
use crate::gatekeeper::Gatekeeper;
use crate::llm_client::LlmClient;
use crate::orchestrator::{CompletionOrchestrator, CompletionSettings};
use crate::prompt::PromptBuilder;
use crate::safety::SafetyFilter;
use crate::scheduler::ReengagementScheduler;
use crate::server::{serve_dashboard, DashboardBinding};
use crate::session::{MoodLexicon, SessionManager};
use crate::store::sqlite::SqliteSessionStore;
use crate::transport::telegram::{run_polling, TelegramTransport};
use crate::transport::ChatTransport;

/// Every long-lived component, wired from one [`BotConfig`].
pub struct BotRuntime {
    pub config: BotConfig,
    pub sessions: Arc<SessionManager>,
    pub credentials: Arc<CredentialPool>,
    pub telegram: Arc<TelegramTransport>,
    pub bot: Arc<ChatBot>,
    pub scheduler: Option<Arc<ReengagementScheduler>>,
    pub dashboard: Option<DashboardBinding>,
    pub events: EventSink,
}

/// When `configured` is set every component gets a reproducible stream.
fn master_rng(configured: Option<u64>) -> StdRng {
    match configured {
        Some(seed) => {
            tracing::info!("Using fixed RNG seed {}", seed);
            StdRng::seed_from_u64(seed)
        }
        None => StdRng::from_entropy(),
    }
}

impl BotRuntime {
    /// Validate configuration and build everything. Nothing is spawned yet.
    pub fn bootstrap(config: BotConfig, events: EventSink) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let dashboard = if config.dashboard.enabled {
            Some(
                DashboardBinding::from_config(&config.dashboard)
                    .context("invalid dashboard configuration")?,
            )
        } else {
            None
        };

        let store = SqliteSessionStore::new(&config.database_path)
            .with_context(|| format!("failed to open session store at {}", config.database_path))?;
        let sessions = Arc::new(SessionManager::new(
            Arc::new(store),
            MoodLexicon::from_config(&config.mood),
            config.mood.initial_mood,
            config.history_window,
        ));

        let credentials = Arc::new(CredentialPool::new(config.llm_api_keys.iter().cloned()));
        tracing::info!(
            "Completion provider {} ({}), {} credential(s)",
            config.llm_api_url,
            config.llm_model,
            credentials.len()
        );

        let timeout = Duration::from_secs(config.request_timeout_secs.max(1));
        let provider = LlmClient::new(config.llm_api_url.clone(), config.llm_model.clone(), timeout)
            .context("failed to build completion client")?;

        let telegram = Arc::new(
            TelegramTransport::new(&config.telegram_api_url, &config.telegram_bot_token)
                .context("failed to build Telegram transport")?,
        );
        let transport: Arc<dyn ChatTransport> = telegram.clone();

        let mut rng = master_rng(config.rng_seed);
        let orchestrator = Arc::new(CompletionOrchestrator::new(
            Arc::new(provider),
            credentials.clone(),
            PromptBuilder::new(config.persona.clone()),
            SafetyFilter::from_config(&config.safety),
            sessions.clone(),
            CompletionSettings {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                timeout,
            },
            StdRng::seed_from_u64(rng.gen()),
        ));

        let bot = Arc::new(ChatBot::new(
            transport.clone(),
            Gatekeeper::new(transport.clone(), config.required_channel_id.clone()),
            sessions.clone(),
            orchestrator,
            ChatBotOptions {
                messages: config.messages.clone(),
                channel_url: join_url(&config),
                strict_membership: config.strict_membership,
            },
            events.clone(),
        ));

        let scheduler = if config.scheduler.enabled {
            Some(Arc::new(ReengagementScheduler::new(
                transport,
                sessions.clone(),
                config.scheduler.clone(),
                config.utc_offset_minutes,
                StdRng::seed_from_u64(rng.gen()),
                events.clone(),
            )?))
        } else {
            tracing::info!("Re-engagement scheduler disabled");
            None
        };

        Ok(Self {
            config,
            sessions,
            credentials,
            telegram,
            bot,
            scheduler,
            dashboard,
            events,
        })
    }

    pub fn spawn_polling(&self) -> JoinHandle<()> {
        tokio::spawn(run_polling(self.telegram.clone(), self.bot.clone()))
    }

    pub fn spawn_scheduler(&self) -> Vec<JoinHandle<()>> {
        match &self.scheduler {
            Some(scheduler) => scheduler.clone().spawn(),
            None => Vec::new(),
        }
    }

    /// Start polling and the scheduler, then serve the dashboard (or just
    /// wait on polling when the dashboard is off).
    pub async fn run(self, event_rx: flume::Receiver<BotEvent>) -> Result<()> {
        let polling = self.spawn_polling();
        let _scheduler = self.spawn_scheduler();

        if let Some(binding) = self.dashboard.clone() {
            serve_dashboard(
                binding,
                self.sessions.clone(),
                self.telegram.clone(),
                self.credentials.clone(),
                self.events.clone(),
                event_rx,
            )
            .await
        } else {
            drop(event_rx);
            polling.await.context("Telegram polling task stopped")
        }
    }
}

/// Configured invite link, or a t.me link derived from a public `@channel` id.
fn join_url(config: &BotConfig) -> String {
    let configured = config.channel_url.trim();
    if !configured.is_empty() {
        return configured.to_string();
    }
    match config.required_channel_id.trim().strip_prefix('@') {
        Some(handle) => format!("https://t.me/{}", handle),
        None => {
            tracing::warn!("CHANNEL_URL is not set; the join button will have no link");
            String::new()
        }
    }
}
