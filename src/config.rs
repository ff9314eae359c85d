//! Configuration types.
//!
//! Everything is read from the environment once at startup. A missing
//! variable falls back to its default; a present but malformed one is an
//! error rather than a silent default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::ai::AiTask;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmCandidate};

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Entity store file.
    pub database_path: PathBuf,
    /// Metrics store file. Point several processes at the same file to share metrics.
    pub metrics_path: PathBuf,
    pub http_port: u16,
    pub cors_origins: Vec<String>,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub llm: LlmSettings,
    pub scheduler: SchedulerConfig,
    pub sync: SyncConfig,
    pub ai: AiConfig,
    pub monitor: MonitorConfig,
}

/// LLM backend settings, before provider selection.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub primary: LlmBackend,
    pub openai_api_key: Option<SecretString>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub gemini_api_key: Option<SecretString>,
    pub gemini_model: String,
    pub gemini_base_url: String,
}

impl LlmSettings {
    /// Ordered candidate list: the configured primary first, the other backend second.
    pub fn candidates(&self) -> Vec<LlmCandidate> {
        let openai = LlmCandidate {
            backend: LlmBackend::OpenAi,
            api_key: self.openai_api_key.clone(),
            model: self.openai_model.clone(),
            base_url: self.openai_base_url.clone(),
        };
        let gemini = LlmCandidate {
            backend: LlmBackend::Gemini,
            api_key: self.gemini_api_key.clone(),
            model: self.gemini_model.clone(),
            base_url: self.gemini_base_url.clone(),
        };
        match self.primary {
            LlmBackend::OpenAi => vec![openai, gemini],
            LlmBackend::Gemini => vec![gemini, openai],
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            primary: LlmBackend::Gemini,
            openai_api_key: None,
            openai_model: "gpt-4-turbo-preview".to_string(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            gemini_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }
}

/// Scheduler loop and default job settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often the loop checks for due jobs.
    pub tick: Duration,
    /// A firing later than this is skipped instead of run.
    pub misfire_grace: Duration,
    pub email_sync_enabled: bool,
    pub email_sync_interval: Duration,
    pub scheduled_lookback_days: u32,
    pub ai_processing_enabled: bool,
    pub ai_processing_interval: Duration,
    pub ai_processing_batch_size: usize,
    pub cleanup_enabled: bool,
    pub cleanup_hour: u32,
    pub cleanup_minute: u32,
    pub sync_log_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            misfire_grace: Duration::from_secs(300),
            email_sync_enabled: false,
            email_sync_interval: Duration::from_secs(5 * 60),
            scheduled_lookback_days: 7,
            ai_processing_enabled: false,
            ai_processing_interval: Duration::from_secs(60 * 60),
            ai_processing_batch_size: 50,
            cleanup_enabled: true,
            cleanup_hour: 2,
            cleanup_minute: 0,
            sync_log_retention_days: 30,
        }
    }
}

/// Mail sync settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub default_lookback_days: u32,
    pub max_messages: u32,
    pub max_body_chars: usize,
    /// Sync a provider thread on demand when AI processing cannot resolve it locally.
    pub sync_missing_threads: bool,
    pub gmail_api_base: String,
    pub graph_api_base: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_lookback_days: 90,
            max_messages: 500,
            max_body_chars: 10_000,
            sync_missing_threads: false,
            gmail_api_base: "https://gmail.googleapis.com/gmail/v1".to_string(),
            graph_api_base: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

/// AI orchestration settings.
#[derive(Debug, Clone)]
pub struct AiConfig {
    pub context_body_max_chars: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub default_tasks: Vec<AiTask>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            context_body_max_chars: 5000,
            retry_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            default_tasks: vec![AiTask::Summarize, AiTask::Reply],
        }
    }
}

/// Worker monitor retention.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub ttl: Duration,
    pub history_cap: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            history_cap: 100,
        }
    }
}

impl AppConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup: &lookup };

        let llm_defaults = LlmSettings::default();
        let primary = match env.string("DEFAULT_LLM_PROVIDER") {
            Some(name) => name.parse::<LlmBackend>().map_err(|e| ConfigError::InvalidValue {
                key: "DEFAULT_LLM_PROVIDER".to_string(),
                message: e,
            })?,
            None => llm_defaults.primary,
        };
        let llm = LlmSettings {
            primary,
            openai_api_key: env.secret("OPENAI_API_KEY"),
            openai_model: env.string("OPENAI_MODEL").unwrap_or(llm_defaults.openai_model),
            openai_base_url: env
                .string("OPENAI_BASE_URL")
                .unwrap_or(llm_defaults.openai_base_url),
            gemini_api_key: env.secret("GEMINI_API_KEY"),
            gemini_model: env.string("GEMINI_MODEL").unwrap_or(llm_defaults.gemini_model),
            gemini_base_url: env
                .string("GEMINI_BASE_URL")
                .unwrap_or(llm_defaults.gemini_base_url),
        };

        let sd = SchedulerConfig::default();
        let scheduler = SchedulerConfig {
            tick: Duration::from_millis(env.parse("SCHEDULER_TICK_MS", 1000u64)?),
            misfire_grace: Duration::from_secs(
                env.parse("SCHEDULER_MISFIRE_GRACE_SECS", sd.misfire_grace.as_secs())?,
            ),
            email_sync_enabled: env.flag("EMAIL_SYNC_JOB_ENABLED", sd.email_sync_enabled)?,
            email_sync_interval: minutes(env.parse("EMAIL_SYNC_INTERVAL_MINUTES", 5u64)?),
            scheduled_lookback_days: env
                .parse("SCHEDULED_SYNC_LOOKBACK_DAYS", sd.scheduled_lookback_days)?,
            ai_processing_enabled: env
                .flag("AI_PROCESSING_JOB_ENABLED", sd.ai_processing_enabled)?,
            ai_processing_interval: minutes(env.parse("AI_PROCESSING_INTERVAL_MINUTES", 60u64)?),
            ai_processing_batch_size: env
                .parse("AI_PROCESSING_BATCH_SIZE", sd.ai_processing_batch_size)?,
            cleanup_enabled: env.flag("CLEANUP_JOB_ENABLED", sd.cleanup_enabled)?,
            cleanup_hour: env.parse("CLEANUP_HOUR_UTC", sd.cleanup_hour)?,
            cleanup_minute: env.parse("CLEANUP_MINUTE_UTC", sd.cleanup_minute)?,
            sync_log_retention_days: env
                .parse("SYNC_LOG_RETENTION_DAYS", sd.sync_log_retention_days)?,
        };
        if scheduler.cleanup_hour > 23 || scheduler.cleanup_minute > 59 {
            return Err(ConfigError::InvalidValue {
                key: "CLEANUP_HOUR_UTC/CLEANUP_MINUTE_UTC".to_string(),
                message: format!(
                    "{}:{} is not a time of day",
                    scheduler.cleanup_hour, scheduler.cleanup_minute
                ),
            });
        }

        let syd = SyncConfig::default();
        let sync = SyncConfig {
            default_lookback_days: env
                .parse("EMAIL_SYNC_LOOKBACK_DAYS", syd.default_lookback_days)?,
            max_messages: env.parse("EMAIL_SYNC_MAX_MESSAGES", syd.max_messages)?,
            max_body_chars: env.parse("EMAIL_BODY_MAX_CHARS", syd.max_body_chars)?,
            sync_missing_threads: env.flag("SYNC_MISSING_THREADS", syd.sync_missing_threads)?,
            gmail_api_base: env.string("GMAIL_API_BASE").unwrap_or(syd.gmail_api_base),
            graph_api_base: env.string("GRAPH_API_BASE").unwrap_or(syd.graph_api_base),
        };

        let ad = AiConfig::default();
        let ai = AiConfig {
            context_body_max_chars: env
                .parse("AI_CONTEXT_BODY_MAX_CHARS", ad.context_body_max_chars)?,
            retry_attempts: env.parse("AI_RETRY_ATTEMPTS", ad.retry_attempts)?.max(1),
            retry_base_delay: Duration::from_millis(env.parse("AI_RETRY_BASE_DELAY_MS", 1000u64)?),
            default_tasks: ad.default_tasks,
        };

        let md = MonitorConfig::default();
        let monitor = MonitorConfig {
            ttl: Duration::from_secs(env.parse("MONITOR_TTL_DAYS", 7u64)? * 24 * 60 * 60),
            history_cap: env.parse("MONITOR_HISTORY_CAP", md.history_cap)?.max(1),
        };

        Ok(Self {
            database_path: env
                .string("INBOX_DB_PATH")
                .unwrap_or_else(|| "./data/inbox.db".to_string())
                .into(),
            metrics_path: env
                .string("INBOX_METRICS_DB_PATH")
                .unwrap_or_else(|| "./data/worker-metrics.db".to_string())
                .into(),
            http_port: env.parse("INBOX_HTTP_PORT", 8000u16)?,
            cors_origins: env
                .string("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            log_dir: env.string("INBOX_LOG_DIR").map(PathBuf::from),
            llm,
            scheduler,
            sync,
            ai,
            monitor,
        })
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

struct Env<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.string(key).map(SecretString::from)
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{v:?} is not a boolean"),
                }),
            },
        }
    }
}
