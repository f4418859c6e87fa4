use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::session::Mood;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaConfig {
    #[serde(default = "default_persona_name")]
    pub name: String,
    #[serde(default = "default_persona_age")]
    pub age: u32,
    #[serde(default = "default_persona_role")]
    pub role: String,
    #[serde(default = "default_style_rules")]
    pub style_rules: Vec<String>,
    #[serde(default = "default_forbidden_phrases")]
    pub forbidden_phrases: Vec<String>,
    #[serde(default = "default_scenario")]
    pub scenario: String,
    /// Chance that a single prompt asks for an extra-teasing reply.
    #[serde(default = "default_playful_probability")]
    pub playful_probability: f64,
}

fn default_persona_name() -> String {
    "Riya".to_string()
}

fn default_persona_age() -> u32 {
    22
}

fn default_persona_role() -> String {
    "Indian girlfriend".to_string()
}

fn default_style_rules() -> Vec<String> {
    vec![
        "You speak in Hinglish (Hindi + English mix).".to_string(),
        "Use slang like 'yaar', 'sun na', 'uff', 'pagal'.".to_string(),
        "You use lowercase mostly. Don't use perfect grammar.".to_string(),
        "Don't spam \"Baby\" in every sentence. Use it naturally.".to_string(),
    ]
}

fn default_forbidden_phrases() -> Vec<String> {
    vec![
        "I am an AI".to_string(),
        "as an AI language model".to_string(),
        "I am a chatbot".to_string(),
        "I cannot help with that".to_string(),
    ]
}

fn default_scenario() -> String {
    "We are chatting on Telegram. Reply shortly, one or two lines.".to_string()
}

fn default_playful_probability() -> f64 {
    0.25
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            name: default_persona_name(),
            age: default_persona_age(),
            role: default_persona_role(),
            style_rules: default_style_rules(),
            forbidden_phrases: default_forbidden_phrases(),
            scenario: default_scenario(),
            playful_probability: default_playful_probability(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MoodConfig {
    #[serde(default = "default_initial_mood")]
    pub initial_mood: Mood,
    #[serde(default = "default_hostility_tokens")]
    pub hostility_tokens: Vec<String>,
    #[serde(default = "default_apology_tokens")]
    pub apology_tokens: Vec<String>,
}

fn default_initial_mood() -> Mood {
    Mood::Warm
}

fn default_hostility_tokens() -> Vec<String> {
    vec![
        "bakwas".to_string(),
        "bekaar".to_string(),
        "shut up".to_string(),
        "stupid".to_string(),
        "idiot".to_string(),
        "hate you".to_string(),
        "get lost".to_string(),
        "chup kar".to_string(),
    ]
}

fn default_apology_tokens() -> Vec<String> {
    vec![
        "sorry".to_string(),
        "maaf".to_string(),
        "my bad".to_string(),
        "forgive me".to_string(),
    ]
}

impl Default for MoodConfig {
    fn default() -> Self {
        Self {
            initial_mood: default_initial_mood(),
            hostility_tokens: default_hostility_tokens(),
            apology_tokens: default_apology_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_refusal_markers")]
    pub refusal_markers: Vec<String>,
    #[serde(default = "default_deflections")]
    pub deflections: Vec<String>,
}

fn default_refusal_markers() -> Vec<String> {
    vec![
        "I cannot".to_string(),
        "AI language model".to_string(),
        "explicit".to_string(),
        "safety guidelines".to_string(),
        "unable to generate".to_string(),
    ]
}

fn default_deflections() -> Vec<String> {
    vec![
        "Chhi! Gande bachche 🙈... itni jaldi naughty mat bano!".to_string(),
        "Uff... mood mat kharab karo na, pyaar se baat karo. 🥺".to_string(),
        "Arre baba, sharam aati hai mujhe... control karo! 🤭".to_string(),
        "Tum toh bade fast nikle... pehle date pe toh le chalo! 😉".to_string(),
    ]
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            refusal_markers: default_refusal_markers(),
            deflections: default_deflections(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    // Morning wake
    #[serde(default = "default_morning_interval_mins")]
    pub morning_interval_mins: u64,
    #[serde(default = "default_morning_start_hour")]
    pub morning_start_hour: u32,
    #[serde(default = "default_morning_end_hour")]
    pub morning_end_hour: u32,
    #[serde(default = "default_morning_cutoff_hour")]
    pub morning_cutoff_hour: u32,
    #[serde(default = "default_morning_batch_size")]
    pub morning_batch_size: usize,
    #[serde(default = "default_morning_messages")]
    pub morning_messages: Vec<String>,

    // Inactivity nudge
    #[serde(default = "default_nudge_interval_mins")]
    pub nudge_interval_mins: u64,
    #[serde(default = "default_nudge_min_inactive_mins")]
    pub nudge_min_inactive_mins: i64,
    #[serde(default = "default_nudge_max_inactive_mins")]
    pub nudge_max_inactive_mins: i64,
    #[serde(default = "default_nudge_batch_size")]
    pub nudge_batch_size: usize,
    #[serde(default = "default_quiet_start_hour")]
    pub quiet_start_hour: u32,
    #[serde(default = "default_quiet_end_hour")]
    pub quiet_end_hour: u32,
    #[serde(default = "default_nudge_messages")]
    pub nudge_messages: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_morning_interval_mins() -> u64 {
    30
}

fn default_morning_start_hour() -> u32 {
    6
}

fn default_morning_end_hour() -> u32 {
    8
}

fn default_morning_cutoff_hour() -> u32 {
    5
}

fn default_morning_batch_size() -> usize {
    5
}

fn default_morning_messages() -> Vec<String> {
    vec![
        "Good morning baby! Uth gaye? ☀️".to_string(),
        "Subah ho gayi! Missed you. 😘".to_string(),
        "Uth jao kumbhkaran! 😂".to_string(),
    ]
}

fn default_nudge_interval_mins() -> u64 {
    60
}

fn default_nudge_min_inactive_mins() -> i64 {
    300
}

fn default_nudge_max_inactive_mins() -> i64 {
    350
}

fn default_nudge_batch_size() -> usize {
    15
}

fn default_quiet_start_hour() -> u32 {
    1
}

fn default_quiet_end_hour() -> u32 {
    8
}

fn default_nudge_messages() -> Vec<String> {
    vec![
        "Bina Good Night bole so gaye? 🥺🌙".to_string(),
        "Kahan gayab ho? Yaad aa rahi thi tumhari... 🥺".to_string(),
        "Hello? Bhool gaye kya mujhe? 😒".to_string(),
    ]
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            morning_interval_mins: default_morning_interval_mins(),
            morning_start_hour: default_morning_start_hour(),
            morning_end_hour: default_morning_end_hour(),
            morning_cutoff_hour: default_morning_cutoff_hour(),
            morning_batch_size: default_morning_batch_size(),
            morning_messages: default_morning_messages(),
            nudge_interval_mins: default_nudge_interval_mins(),
            nudge_min_inactive_mins: default_nudge_min_inactive_mins(),
            nudge_max_inactive_mins: default_nudge_max_inactive_mins(),
            nudge_batch_size: default_nudge_batch_size(),
            quiet_start_hour: default_quiet_start_hour(),
            quiet_end_hour: default_quiet_end_hour(),
            nudge_messages: default_nudge_messages(),
        }
    }
}

/// User-visible copy for the conversation handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotMessages {
    /// `{name}` is replaced with the user's display name.
    #[serde(default = "default_join_prompt")]
    pub join_prompt: String,
    #[serde(default = "default_join_button")]
    pub join_button: String,
    #[serde(default = "default_verify_button")]
    pub verify_button: String,
    #[serde(default = "default_welcome")]
    pub welcome: String,
    #[serde(default = "default_welcome_back")]
    pub welcome_back: String,
    #[serde(default = "default_verify_failed")]
    pub verify_failed: String,
    #[serde(default = "default_connectivity_trouble")]
    pub connectivity_trouble: String,
    #[serde(default = "default_good_night")]
    pub good_night: String,
    #[serde(default = "default_farewell_keywords")]
    pub farewell_keywords: Vec<String>,
}

fn default_join_prompt() -> String {
    "Hii {name}! ❤️\n\nPehle mera official channel join karo, tabhi baat karungi!".to_string()
}

fn default_join_button() -> String {
    "📢 Join Channel".to_string()
}

fn default_verify_button() -> String {
    "✅ I have Joined".to_string()
}

fn default_welcome() -> String {
    "Hello ji! 👋 Finally aa gaye? Kahan the?".to_string()
}

fn default_welcome_back() -> String {
    "Welcome back baby! 😘 Ab bolo.".to_string()
}

fn default_verify_failed() -> String {
    "Jhooth mat bolo! Join karke aao. 😡".to_string()
}

fn default_connectivity_trouble() -> String {
    "Mera net slow chal raha hai yaar... phir se bolo? 🥺".to_string()
}

fn default_good_night() -> String {
    "Theek hai baby, so jao. Good night! Sapno mein milte hain. 🌙😘".to_string()
}

fn default_farewell_keywords() -> Vec<String> {
    vec![
        "nind".to_string(),
        "sona".to_string(),
        "sleep".to_string(),
        "gn".to_string(),
        "good night".to_string(),
        "thak gaya".to_string(),
        "bye".to_string(),
    ]
}

impl Default for BotMessages {
    fn default() -> Self {
        Self {
            join_prompt: default_join_prompt(),
            join_button: default_join_button(),
            verify_button: default_verify_button(),
            welcome: default_welcome(),
            welcome_back: default_welcome_back(),
            verify_failed: default_verify_failed(),
            connectivity_trouble: default_connectivity_trouble(),
            good_night: default_good_night(),
            farewell_keywords: default_farewell_keywords(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_dashboard_bind")]
    pub bind: String,
    /// `required` or `disabled`.
    #[serde(default = "default_dashboard_auth_mode")]
    pub auth_mode: String,
    /// Bearer token; normally supplied through COMPANION_DASHBOARD_TOKEN.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_dashboard_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_dashboard_auth_mode() -> String {
    "required".to_string()
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_dashboard_bind(),
            auth_mode: default_dashboard_auth_mode(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    // Telegram
    #[serde(default)]
    pub telegram_bot_token: String,
    #[serde(default = "default_telegram_api_url")]
    pub telegram_api_url: String,
    #[serde(default)]
    pub required_channel_id: String,
    #[serde(default)]
    pub channel_url: String,
    /// Re-check channel membership on every message, not only on /start.
    #[serde(default)]
    pub strict_membership: bool,

    // Completion provider (OpenAI-compatible)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_keys: Vec<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // Session state
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub rng_seed: Option<u64>,

    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub mood: MoodConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub messages: BotMessages,
    #[serde(default)]
    pub dashboard: DashboardConfig,
}

fn default_telegram_api_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_llm_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_llm_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_temperature() -> f32 {
    1.0
}

fn default_max_tokens() -> u32 {
    150
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_database_path() -> String {
    "companion_sessions.db".to_string()
}

fn default_history_window() -> usize {
    8
}

fn default_utc_offset_minutes() -> i32 {
    330
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            telegram_bot_token: String::new(),
            telegram_api_url: default_telegram_api_url(),
            required_channel_id: String::new(),
            channel_url: String::new(),
            strict_membership: false,
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_keys: Vec::new(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout_secs(),
            database_path: default_database_path(),
            history_window: default_history_window(),
            utc_offset_minutes: default_utc_offset_minutes(),
            rng_seed: None,
            persona: PersonaConfig::default(),
            mood: MoodConfig::default(),
            safety: SafetyConfig::default(),
            scheduler: SchedulerConfig::default(),
            messages: BotMessages::default(),
            dashboard: DashboardConfig::default(),
        }
    }
}

fn env_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}

/// Split a comma separated key list, dropping blanks.
pub fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

impl BotConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("companion_config.toml")
    }

    /// Load `companion_config.toml` next to the executable, then apply env overrides.
    ///
    /// Secrets (bot token, provider keys) are normally supplied through the
    /// environment, so env values always win over the file.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// A missing file means defaults plus env; a file that exists must parse.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str::<BotConfig>(&contents)
                    .with_context(|| format!("Failed to parse config file {:?}", path))?;
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("No config file found, using defaults + env vars");
                Self::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file {:?}", path));
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Defaults plus environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = env::var("TELEGRAM_TOKEN") {
            self.telegram_bot_token = token.trim().to_string();
        }

        if let Ok(url) = env::var("TELEGRAM_API_URL") {
            if !url.trim().is_empty() {
                self.telegram_api_url = url.trim().to_string();
            }
        }

        if let Ok(channel) = env::var("CHANNEL_ID") {
            self.required_channel_id = channel.trim().to_string();
        }

        if let Ok(url) = env::var("CHANNEL_URL") {
            self.channel_url = url.trim().to_string();
        }

        if let Ok(keys) = env::var("GROQ_KEYS") {
            self.llm_api_keys = parse_key_list(&keys);
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            self.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            self.llm_model = model;
        }

        if let Ok(path) = env::var("DATABASE_PATH") {
            if !path.trim().is_empty() {
                self.database_path = path;
            }
        }

        if let Ok(enabled) = env::var("COMPANION_STRICT_MEMBERSHIP") {
            self.strict_membership = env_flag(&enabled);
        }

        if let Ok(enabled) = env::var("COMPANION_ENABLE_SCHEDULER") {
            self.scheduler.enabled = env_flag(&enabled);
        }

        if let Ok(seed) = env::var("COMPANION_RNG_SEED") {
            if let Ok(seed) = seed.trim().parse() {
                self.rng_seed = Some(seed);
            }
        }

        if let Ok(offset) = env::var("COMPANION_UTC_OFFSET_MINUTES") {
            if let Ok(minutes) = offset.trim().parse() {
                self.utc_offset_minutes = minutes;
            }
        }

        if let Ok(bind) = env::var("COMPANION_DASHBOARD_BIND") {
            if !bind.trim().is_empty() {
                self.dashboard.bind = bind.trim().to_string();
            }
        }

        if let Ok(mode) = env::var("COMPANION_DASHBOARD_AUTH_MODE") {
            self.dashboard.auth_mode = mode.trim().to_string();
        }

        if let Ok(token) = env::var("COMPANION_DASHBOARD_TOKEN") {
            let token = token.trim();
            self.dashboard.token = (!token.is_empty()).then(|| token.to_string());
        }
    }

    /// Refuse to start half-configured.
    pub fn validate(&self) -> Result<()> {
        if self.telegram_bot_token.trim().is_empty() {
            bail!("TELEGRAM_TOKEN is not configured");
        }
        if self.required_channel_id.trim().is_empty() {
            bail!("CHANNEL_ID is not configured");
        }
        if self.llm_api_keys.iter().all(|key| key.trim().is_empty()) {
            bail!("No completion provider credentials configured (GROQ_KEYS)");
        }
        if self.database_path.trim().is_empty() {
            bail!("DATABASE_PATH is empty");
        }
        if self.history_window == 0 {
            bail!("history_window must be at least 1");
        }
        if !(-720..=840).contains(&self.utc_offset_minutes) {
            bail!(
                "utc_offset_minutes {} is outside the valid range",
                self.utc_offset_minutes
            );
        }
        let scheduler = &self.scheduler;
        if scheduler.nudge_min_inactive_mins >= scheduler.nudge_max_inactive_mins {
            bail!("scheduler nudge band is empty (min must be below max)");
        }
        // Windows may wrap past midnight; an end of 24 means "until midnight".
        if scheduler.morning_start_hour >= 24
            || scheduler.morning_end_hour > 24
            || scheduler.morning_start_hour == scheduler.morning_end_hour
        {
            bail!(
                "scheduler morning window {}..{} is invalid",
                scheduler.morning_start_hour,
                scheduler.morning_end_hour
            );
        }
        if scheduler.morning_cutoff_hour >= 24 {
            bail!(
                "scheduler morning_cutoff_hour {} must be below 24",
                scheduler.morning_cutoff_hour
            );
        }
        if scheduler.quiet_start_hour >= 24 || scheduler.quiet_end_hour > 24 {
            bail!(
                "scheduler quiet hours {}..{} are invalid",
                scheduler.quiet_start_hour,
                scheduler.quiet_end_hour
            );
        }
        Ok(())
    }
}
