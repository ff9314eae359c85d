//! Prompt templates, one per AI task.
//!
//! Every function here is pure: the same thread always yields the same prompt.

use std::fmt::Write;

use super::types::{BusinessContext, SentimentOutput};

pub const DEFAULT_TONE: &str = "professional and helpful";

/// One message of a thread, already cleaned for prompting.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptMessage {
    pub sender: String,
    pub timestamp: String,
    pub body: String,
}

fn thread_text(subject: &str, messages: &[PromptMessage], with_dates: bool) -> String {
    let mut out = format!("Subject: {subject}\n\n");
    for msg in messages {
        if with_dates {
            let _ = write!(
                out,
                "From: {}\nDate: {}\nMessage:\n{}\n\n---\n\n",
                msg.sender, msg.timestamp, msg.body
            );
        } else {
            let _ = write!(out, "From: {}:\n{}\n\n---\n\n", msg.sender, msg.body);
        }
    }
    out
}

fn role_names(ctx: &BusinessContext) -> String {
    ctx.roles.keys().cloned().collect::<Vec<_>>().join(", ")
}

pub fn summary(subject: &str, messages: &[PromptMessage], ctx: Option<&BusinessContext>) -> String {
    let context = ctx
        .map(|c| {
            format!(
                "Company Context:\n- Company: {}\n- Products/Services: {}\n",
                c.company_description.as_deref().unwrap_or("N/A"),
                c.products.join(", ")
            )
        })
        .unwrap_or_default();

    format!(
        "You are an AI assistant helping to summarize email conversations.\n\n\
{context}\n\
Email Thread:\n{thread}\n\
Task: Provide a concise summary of this email thread in 2-3 sentences (max 120 words).\n\n\
Requirements:\n\
- Focus on key points and action items\n\
- Identify the main topic or issue\n\
- Note any decisions made or pending\n\
- Use clear, professional language\n\n\
Summary:",
        thread = thread_text(subject, messages, true),
    )
}

pub fn classify(
    subject: &str,
    latest: &PromptMessage,
    ctx: Option<&BusinessContext>,
) -> String {
    let context = ctx
        .map(|c| {
            format!(
                "Company Context:\n- Known team roles: {}\n- Products: {}\n",
                role_names(c),
                c.products.join(", ")
            )
        })
        .unwrap_or_default();

    format!(
        "You are an AI assistant that classifies email priority for a business inbox.\n\n\
{context}\n\
Email:\nSubject: {subject}\nFrom: {sender}\nBody:\n{body}\n\n\
Task: Classify this email's priority and category.\n\n\
Priority Levels:\n\
- urgent: Requires immediate attention (angry customer, system down, legal issue, executive request)\n\
- customer: Customer inquiry or support request (not urgent)\n\
- vendor: Communication from vendors/partners\n\
- internal: Internal team communication\n\
- low: Newsletters, updates, non-critical information\n\n\
Output as JSON:\n\
{{\n\
    \"priority_level\": \"urgent|customer|vendor|internal|low\",\n\
    \"category\": \"brief category description (e.g., 'customer complaint', 'billing inquiry')\",\n\
    \"reasoning\": \"brief explanation for the classification\"\n\
}}",
        sender = latest.sender,
        body = latest.body,
    )
}

pub fn sentiment(subject: &str, messages: &[PromptMessage]) -> String {
    format!(
        "You are an AI assistant specialized in analyzing the emotional tone of email conversations.\n\n\
Email Thread:\n{thread}\n\
Task: Analyze the sentiment and emotional tone of this email conversation.\n\n\
Output as JSON:\n\
{{\n\
    \"sentiment_score\": <float between -1.0 (very negative) and 1.0 (very positive)>,\n\
    \"sentiment_label\": \"positive|neutral|negative\",\n\
    \"anger_level\": <float between 0.0 (calm) and 1.0 (very angry)>,\n\
    \"urgency_level\": <float between 0.0 (not urgent) and 1.0 (extremely urgent)>,\n\
    \"emotions\": [\"phrases or words that indicate the sentiment\"],\n\
    \"reasoning\": \"one sentence\"\n\
}}\n\n\
Consider:\n\
- Tone and language used\n\
- Presence of complaints, frustration, or appreciation\n\
- Time-sensitive language\n\
- ALL CAPS, exclamation marks, aggressive wording",
        thread = thread_text(subject, messages, false),
    )
}

pub fn reply(
    subject: &str,
    messages: &[PromptMessage],
    ctx: Option<&BusinessContext>,
    tone: &str,
) -> String {
    let context = ctx.map(reply_context).unwrap_or_default();
    format!(
        "You are an AI email assistant helping to draft professional email responses.\n\n\
{context}\n\
Email Conversation:\n{thread}\n\
Task: Draft a reply to the most recent email in this thread.\n\n\
Requirements:\n\
- Tone: {tone}\n\
- Address the sender's questions or concerns directly\n\
- Use company policies and FAQ information when relevant\n\
- Keep the reply VERY SHORT and concise (maximum 100 words)\n\
- Do NOT include subject line, greetings like \"Dear\", or closing signatures\n\
- Start directly with the response content\n\n\
Draft Reply:",
        thread = thread_text(subject, messages, false),
    )
}

fn reply_context(ctx: &BusinessContext) -> String {
    let mut out = format!(
        "Company Information:\n- Company: {}\n- Products/Services: {}\n- Tone Guidelines: {}\n",
        ctx.company_description.as_deref().unwrap_or(""),
        ctx.products.join(", "),
        ctx.tone.as_deref().unwrap_or(DEFAULT_TONE),
    );
    if !ctx.policies.is_empty() {
        out.push_str("\nCompany Policies:\n");
        for (name, policy) in &ctx.policies {
            let _ = writeln!(out, "- {name}: {policy}");
        }
    }
    if !ctx.faq.is_empty() {
        out.push_str("\nFrequently Asked Questions:\n");
        for entry in &ctx.faq {
            let _ = writeln!(out, "Q: {}\nA: {}", entry.question, entry.answer);
        }
    }
    if !ctx.roles.is_empty() {
        out.push_str("\nTeam Roles:\n");
        for (role, duty) in &ctx.roles {
            let _ = writeln!(out, "- {role}: {duty}");
        }
    }
    out
}

pub fn tasks(subject: &str, messages: &[PromptMessage], ctx: Option<&BusinessContext>) -> String {
    let roles = ctx
        .filter(|c| !c.roles.is_empty())
        .map(|c| format!("Known team roles: {}\n", role_names(c)))
        .unwrap_or_default();

    format!(
        "You are an AI assistant that extracts action items and tasks from email conversations.\n\n\
{roles}\n\
Email Thread:\n{thread}\n\
Task: Extract all action items, tasks, and deliverables mentioned in this email thread.\n\n\
Output as JSON:\n\
{{\"tasks\": [\n\
    {{\n\
        \"title\": \"brief task title\",\n\
        \"description\": \"detailed task description\",\n\
        \"due_date\": \"YYYY-MM-DD or null if not mentioned\",\n\
        \"extracted_owner\": \"person or role responsible (or null if not clear)\",\n\
        \"priority\": \"high|medium|low\"\n\
    }}\n\
]}}\n\n\
Rules:\n\
- Only extract explicit action items (things that need to be done)\n\
- Ignore completed tasks or past events\n\
- If no tasks are found, return {{\"tasks\": []}}\n\
- Do not invent tasks that aren't clearly stated",
        thread = thread_text(subject, messages, false),
    )
}

pub fn rewrite(draft: &str, instruction: &str) -> String {
    format!(
        "You are an AI assistant that rewrites email drafts with different styles.\n\n\
Original Draft:\n{draft}\n\n\
Task: Rewrite this draft to be {instruction}.\n\n\
Requirements:\n\
- Maintain the core message and information\n\
- Apply the requested style change\n\
- Keep it professional\n\
- Do NOT add subject line or closing signature\n\
- Return only the rewritten body text\n\n\
Rewritten Draft:"
    )
}

pub fn escalation(
    subject: &str,
    latest: &PromptMessage,
    sentiment: &SentimentOutput,
    priority_level: &str,
) -> String {
    format!(
        "You are an AI assistant that determines if an email requires immediate escalation to the team.\n\n\
Email:\nSubject: {subject}\nBody: {body}\n\n\
Context:\n\
- Priority: {priority_level}\n\
- Sentiment: {label}\n\
- Anger Level: {anger:.2}\n\
- Urgency Level: {urgency:.2}\n\n\
Task: Determine if this email should trigger an immediate alert to the team.\n\n\
Escalation Criteria:\n\
- Very angry or frustrated customer\n\
- Urgent issue affecting service\n\
- Legal or compliance matter\n\
- Executive-level communication\n\
- SLA breach or imminent breach\n\
- Security incident\n\n\
Output as JSON:\n\
{{\n\
    \"should_escalate\": true|false,\n\
    \"reason\": \"brief explanation\",\n\
    \"suggested_owner\": \"which team member or role should handle this\",\n\
    \"urgency_level\": \"critical|high|medium|low\"\n\
}}",
        body = latest.body,
        label = sentiment.sentiment_label,
        anger = sentiment.anger_level,
        urgency = sentiment.urgency_level,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> Vec<PromptMessage> {
        vec![
            PromptMessage {
                sender: "alice@customer.com".to_string(),
                timestamp: "2025-01-14T10:30:00Z".to_string(),
                body: "Where is my refund?".to_string(),
            },
            PromptMessage {
                sender: "support@us.com".to_string(),
                timestamp: "2025-01-14T11:00:00Z".to_string(),
                body: "Looking into it.".to_string(),
            },
        ]
    }

    fn context() -> BusinessContext {
        let mut ctx = BusinessContext {
            user_id: "u1".to_string(),
            tone: Some("warm".to_string()),
            company_description: Some("Acme Widgets".to_string()),
            products: vec!["Widget".to_string(), "Gadget".to_string()],
            ..Default::default()
        };
        ctx.roles.insert("billing".to_string(), "refunds".to_string());
        ctx.policies
            .insert("refunds".to_string(), "within 30 days".to_string());
        ctx
    }

    #[test]
    fn prompts_are_deterministic() {
        let msgs = messages();
        let ctx = context();
        assert_eq!(
            summary("Refund", &msgs, Some(&ctx)),
            summary("Refund", &msgs, Some(&ctx))
        );
        assert_eq!(tasks("Refund", &msgs, None), tasks("Refund", &msgs, None));
    }

    #[test]
    fn summary_includes_thread_and_context() {
        let prompt = summary("Refund", &messages(), Some(&context()));
        assert!(prompt.contains("Subject: Refund"));
        assert!(prompt.contains("Date: 2025-01-14T10:30:00Z"));
        assert!(prompt.contains("Acme Widgets"));
        assert!(prompt.contains("Widget, Gadget"));
        assert!(!summary("Refund", &messages(), None).contains("Company Context"));
    }

    #[test]
    fn classify_uses_latest_message_and_roles() {
        let msgs = messages();
        let prompt = classify("Refund", &msgs[1], Some(&context()));
        assert!(prompt.contains("From: support@us.com"));
        assert!(prompt.contains("Known team roles: billing"));
        assert!(prompt.contains("\"priority_level\""));
    }

    #[test]
    fn reply_carries_tone_and_policies() {
        let prompt = reply("Refund", &messages(), Some(&context()), "warm");
        assert!(prompt.contains("- Tone: warm"));
        assert!(prompt.contains("- refunds: within 30 days"));
        assert!(prompt.contains("- billing: refunds"));
    }

    #[test]
    fn escalation_embeds_signals() {
        let sentiment = SentimentOutput {
            sentiment_score: -0.8,
            sentiment_label: "negative".to_string(),
            anger_level: 0.9,
            urgency_level: 0.75,
            emotions: vec![],
            reasoning: String::new(),
        };
        let prompt = escalation("Refund", &messages()[0], &sentiment, "urgent");
        assert!(prompt.contains("- Priority: urgent"));
        assert!(prompt.contains("- Anger Level: 0.90"));
        assert!(prompt.contains("Body: Where is my refund?"));
    }

    #[test]
    fn rewrite_names_instruction() {
        let prompt = rewrite("Thanks for reaching out.", "more formal");
        assert!(prompt.contains("Rewrite this draft to be more formal."));
        assert!(prompt.contains("Thanks for reaching out."));
    }
}
