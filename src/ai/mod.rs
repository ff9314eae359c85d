//! AI-driven thread analysis.
//!
//! [`AiOrchestrator`] turns a stored thread into prompts, calls the selected
//! LLM under the retry policy and parses what comes back. [`ArtifactService`]
//! sits on top and persists the results per thread.

mod artifacts;
mod orchestrator;
pub mod parse;
pub mod prompts;
mod types;

pub use artifacts::{ArtifactOutput, ArtifactService};
pub use orchestrator::{AiOrchestrator, ThreadContext};
pub use types::{
    AiTask, BusinessContext, EscalationOutput, ExtractedTask, FaqEntry, PriorityLevel,
    PriorityOutput, ReplyOutput, SentimentOutput,
};
