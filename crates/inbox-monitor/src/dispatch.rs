//! Turning a fetched message into a notification
//!
//! The authors filter runs first so enrichment is never spent on a message
//! that won't be shown. Enrichment is best effort: a failed summary or tone
//! analysis is logged and the message goes out without it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mail_api::{Attachment, MessageDetails};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::authors::NotifiableAuthors;
use crate::error::DispatchError;

/// Average adult reading speed used for read time estimates.
pub const WORDS_PER_MINUTE: f64 = 230.0;

/// Bodies shorter than this are shown as-is rather than summarized.
pub const MIN_SUMMARY_CHARS: usize = 100;

type DispatchResult<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn label(self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
        }
    }
}

/// Tone analysis of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToneScore {
    /// Sentiment label, e.g. `NEGATIVE`
    pub label: String,
    #[serde(default)]
    pub score: f32,
    pub urgency: Urgency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadTime {
    pub minutes: u64,
    pub seconds: u64,
    pub total_seconds: u64,
    pub word_count: usize,
}

/// Estimated time to read `text`.
pub fn estimate_read_time(text: &str) -> ReadTime {
    let word_count = text.split_whitespace().count();
    let total_minutes = word_count as f64 / WORDS_PER_MINUTE;
    let minutes = total_minutes.floor();
    ReadTime {
        minutes: minutes as u64,
        seconds: ((total_minutes - minutes) * 60.0).round() as u64,
        total_seconds: (total_minutes * 60.0).round() as u64,
        word_count,
    }
}

/// What the notifier shows for one message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub message_id: String,
    pub sender_name: String,
    pub sender_address: String,
    pub subject: String,
    /// Summary when `is_summary`, otherwise the body
    pub text: String,
    pub is_summary: bool,
    pub tone: Option<ToneScore>,
    pub read_time: Option<ReadTime>,
    pub attachments: Vec<Attachment>,
}

/// Optional text analysis (summaries, tone).
pub trait Enricher: Send + Sync {
    fn summarize<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = DispatchResult<String>> + Send + 'a>>;

    fn tone<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = DispatchResult<ToneScore>> + Send + 'a>>;
}

/// Where notifications end up.
pub trait Notifier: Send + Sync {
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = DispatchResult<()>> + Send + 'a>>;

    /// Current number of unread messages, for a badge or status line.
    fn unread_count(&self, count: usize);
}

/// Which enrichments run for each message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSettings {
    pub summarize: bool,
    pub tone: bool,
    pub read_time: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            summarize: false,
            tone: true,
            read_time: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Notified,
    /// Sender is not a notifiable author
    Filtered,
    /// Notifier failed; already logged
    Failed,
}

impl DispatchOutcome {
    pub fn label(self) -> &'static str {
        match self {
            DispatchOutcome::Notified => "notified",
            DispatchOutcome::Filtered => "filtered",
            DispatchOutcome::Failed => "failed",
        }
    }
}

/// Filters, enriches and hands messages to the notifier.
pub struct Dispatcher {
    authors: Arc<NotifiableAuthors>,
    enricher: Option<Arc<dyn Enricher>>,
    notifier: Arc<dyn Notifier>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        authors: Arc<NotifiableAuthors>,
        enricher: Option<Arc<dyn Enricher>>,
        notifier: Arc<dyn Notifier>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            authors,
            enricher,
            notifier,
            settings,
        }
    }

    pub fn authors(&self) -> &Arc<NotifiableAuthors> {
        &self.authors
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub async fn dispatch(&self, details: MessageDetails) -> DispatchOutcome {
        if !self.authors.allows(&details.from_address).await {
            debug!(
                message_id = %details.id,
                sender = %details.from_address,
                "sender is not a notifiable author, skipping"
            );
            return DispatchOutcome::Filtered;
        }

        let tone = self.tone(&details).await;
        let (text, is_summary) = self.display_text(&details).await;
        let read_time = self
            .settings
            .read_time
            .then(|| estimate_read_time(&details.text));

        let notification = Notification {
            message_id: details.id,
            sender_name: details.from_name,
            sender_address: details.from_address,
            subject: details.subject,
            text,
            is_summary,
            tone,
            read_time,
            attachments: details.attachments,
        };

        match self.notifier.notify(&notification).await {
            Ok(()) => {
                debug!(message_id = %notification.message_id, "notification dispatched");
                DispatchOutcome::Notified
            }
            Err(e) => {
                warn!(message_id = %notification.message_id, error = %e, "notification failed");
                DispatchOutcome::Failed
            }
        }
    }

    async fn tone(&self, details: &MessageDetails) -> Option<ToneScore> {
        let enricher = self.enricher.as_ref().filter(|_| self.settings.tone)?;
        match enricher.tone(&details.analysis_text()).await {
            Ok(tone) => Some(tone),
            Err(e) => {
                warn!(message_id = %details.id, error = %e, "tone analysis failed, continuing without it");
                None
            }
        }
    }

    async fn display_text(&self, details: &MessageDetails) -> (String, bool) {
        let body = details.text.clone();
        let Some(enricher) = self.enricher.as_ref().filter(|_| self.settings.summarize) else {
            return (body, false);
        };
        if body.trim().chars().count() < MIN_SUMMARY_CHARS {
            return (body, false);
        }
        match enricher.summarize(&body).await {
            Ok(summary) if !summary.trim().is_empty() => {
                let is_summary = summary != body;
                (summary, is_summary)
            }
            Ok(_) => (body, false),
            Err(e) => {
                warn!(message_id = %details.id, error = %e, "summary failed, showing the body");
                (body, false)
            }
        }
    }
}
