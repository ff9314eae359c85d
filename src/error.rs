//! Error types for the inbox worker framework.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Metrics store error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Mail provider error: {0}")]
    Mail(#[from] MailError),

    #[error("AI error: {0}")]
    Ai(#[from] AiError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Entity store errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Shared metrics store errors.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Metrics backend failed: {0}")]
    Backend(String),

    #[error("Failed to decode metrics value at {key}: {reason}")]
    Decode { key: String, reason: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("No LLM provider has a configured credential")]
    NoCredentials,
}

/// Mail provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("{provider} API request failed: {reason}")]
    Http { provider: String, reason: String },

    #[error("User {user_id} has no connected {provider} account")]
    NotConnected { user_id: String, provider: String },

    #[error("Failed to decode {provider} message: {reason}")]
    Decode { provider: String, reason: String },

    #[error("Unsupported mail provider: {0}")]
    Unsupported(String),

    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Nothing to send for thread {0}: no body given and no reply draft stored")]
    EmptyReply(String),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// AI orchestration errors.
///
/// `Validation` and `Parse` are never retried. `ServiceUnavailable` is what
/// remains after the retry policy gave up on the backend.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Invalid AI request: {0}")]
    Validation(String),

    #[error("AI service temporarily unavailable after {attempts} attempts: {reason}")]
    ServiceUnavailable { attempts: u32, reason: String },

    #[error("Failed to parse AI response: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(#[from] DatabaseError),
}

/// Scheduler errors.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Invalid trigger: {0}")]
    InvalidTrigger(String),
}

/// Errors raised from a worker's `execute()` body.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Ai(#[from] AiError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

pub type Result<T> = std::result::Result<T, Error>;
