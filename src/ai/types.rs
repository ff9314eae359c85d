//! AI task kinds and the structured outputs they produce.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A unit of per-thread AI processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AiTask {
    #[serde(alias = "summary")]
    Summarize,
    #[serde(alias = "priority")]
    Classify,
    Sentiment,
    #[serde(alias = "draft")]
    Reply,
    Tasks,
    Escalation,
}

impl AiTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Classify => "classify",
            Self::Sentiment => "sentiment",
            Self::Reply => "reply",
            Self::Tasks => "tasks",
            Self::Escalation => "escalation",
        }
    }
}

impl fmt::Display for AiTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiTask {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "summarize" | "summary" => Ok(Self::Summarize),
            "classify" | "priority" => Ok(Self::Classify),
            "sentiment" => Ok(Self::Sentiment),
            "reply" | "draft" => Ok(Self::Reply),
            "tasks" => Ok(Self::Tasks),
            "escalation" => Ok(Self::Escalation),
            other => Err(format!("unknown AI task: {other}")),
        }
    }
}

/// Inbox priority bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum PriorityLevel {
    Urgent,
    Customer,
    Vendor,
    Internal,
    Low,
}

impl PriorityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Urgent => "urgent",
            Self::Customer => "customer",
            Self::Vendor => "vendor",
            Self::Internal => "internal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown labels fall back to `Low`.
impl From<String> for PriorityLevel {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "urgent" => Self::Urgent,
            "customer" => Self::Customer,
            "vendor" => Self::Vendor,
            "internal" => Self::Internal,
            "low" => Self::Low,
            other => {
                tracing::warn!(label = other, "Unknown priority level, using low");
                Self::Low
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityOutput {
    pub priority_level: PriorityLevel,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default)]
    pub reasoning: String,
}

fn default_category() -> String {
    "general".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentOutput {
    /// -1.0 (very negative) to 1.0 (very positive).
    #[serde(default)]
    pub sentiment_score: f64,
    #[serde(default = "default_sentiment_label")]
    pub sentiment_label: String,
    /// 0.0 to 1.0.
    #[serde(default)]
    pub anger_level: f64,
    /// 0.0 to 1.0.
    #[serde(default, alias = "urgency_score")]
    pub urgency_level: f64,
    #[serde(default, alias = "key_indicators")]
    pub emotions: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

fn default_sentiment_label() -> String {
    "neutral".to_string()
}

impl SentimentOutput {
    /// Pull every score back into its documented range.
    ///
    /// Returns the names of the fields that were out of range.
    pub fn clamp_scores(&mut self) -> Vec<&'static str> {
        let mut clamped = Vec::new();
        clamp_field(&mut self.sentiment_score, -1.0, 1.0, "sentiment_score", &mut clamped);
        clamp_field(&mut self.anger_level, 0.0, 1.0, "anger_level", &mut clamped);
        clamp_field(&mut self.urgency_level, 0.0, 1.0, "urgency_level", &mut clamped);
        clamped
    }
}

fn clamp_field(value: &mut f64, min: f64, max: f64, name: &'static str, out: &mut Vec<&'static str>) {
    if value.is_nan() {
        *value = 0.0_f64.clamp(min, max);
        out.push(name);
    } else if *value < min || *value > max {
        *value = value.clamp(min, max);
        out.push(name);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyOutput {
    pub draft_text: String,
    pub tone_used: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTask {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    /// `YYYY-MM-DD` when the thread names one.
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub extracted_owner: Option<String>,
    #[serde(default = "default_task_priority")]
    pub priority: String,
}

fn default_task_priority() -> String {
    "medium".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationOutput {
    #[serde(default)]
    pub should_escalate: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub suggested_owner: String,
    #[serde(default = "default_urgency")]
    pub urgency_level: String,
}

fn default_urgency() -> String {
    "low".to_string()
}

/// Per-user business knowledge injected into prompts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessContext {
    pub user_id: String,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub company_description: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub policies: BTreeMap<String, String>,
    #[serde(default)]
    pub faq: Vec<FaqEntry>,
    /// Role name to responsibilities.
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaqEntry {
    pub question: String,
    pub answer: String,
}
