//! Notification sinks: desktop popups and a log-only fallback

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use inbox_monitor::{DispatchError, Notification, Notifier, Urgency};
use tracing::{debug, info};

const APP_NAME: &str = "mail-notifier";

/// Longest body excerpt shown in a popup.
const BODY_PREVIEW_CHARS: usize = 300;

/// Popup title: sender and subject.
pub fn render_title(n: &Notification) -> String {
    format!("{}: {}", n.sender_name, n.subject)
}

/// Popup body: urgency badge, read time, text, attachment count.
pub fn render_body(n: &Notification, show_urgency: bool) -> String {
    let mut lines = Vec::new();

    if show_urgency && let Some(tone) = &n.tone {
        match tone.urgency {
            Urgency::High => lines.push("Urgent".to_string()),
            Urgency::Medium => lines.push("Important".to_string()),
            Urgency::Low => {}
        }
    }

    if let Some(rt) = &n.read_time {
        lines.push(format!("{} min {} sec read", rt.minutes, rt.seconds));
    }

    let text = n.text.trim();
    if text.is_empty() {
        lines.push("No body content available.".to_string());
    } else if n.is_summary {
        lines.push(format!("Summary: {text}"));
    } else {
        lines.push(preview(text));
    }

    match n.attachments.len() {
        0 => {}
        1 => lines.push("1 attachment".to_string()),
        count => lines.push(format!("{count} attachments")),
    }

    lines.join("\n")
}

fn preview(text: &str) -> String {
    match text.char_indices().nth(BODY_PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

/// Shows each notification as a desktop popup.
pub struct DesktopNotifier {
    show_urgency: bool,
    unread: AtomicUsize,
}

impl DesktopNotifier {
    pub fn new(show_urgency: bool) -> Self {
        Self {
            show_urgency,
            unread: AtomicUsize::new(0),
        }
    }
}

impl Notifier for DesktopNotifier {
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        let title = render_title(notification);
        let body = render_body(notification, self.show_urgency);
        Box::pin(async move {
            // The notification daemon call blocks on D-Bus / the OS API
            tokio::task::spawn_blocking(move || {
                notify_rust::Notification::new()
                    .appname(APP_NAME)
                    .summary(&title)
                    .body(&body)
                    .show()
                    .map(|_| ())
            })
            .await
            .map_err(|e| DispatchError::Notification(format!("notification task failed: {e}")))?
            .map_err(|e| DispatchError::Notification(e.to_string()))
        })
    }

    fn unread_count(&self, count: usize) {
        let previous = self.unread.swap(count, Ordering::Relaxed);
        if previous != count {
            debug!(unread = count, "unread count changed");
        }
    }
}

/// Logs notifications instead of showing them, for headless hosts.
#[derive(Default)]
pub struct LogNotifier {
    unread: AtomicUsize,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_unread(&self) -> usize {
        self.unread.load(Ordering::Relaxed)
    }
}

impl Notifier for LogNotifier {
    fn notify<'a>(
        &'a self,
        notification: &'a Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + 'a>> {
        Box::pin(async move {
            info!(
                message_id = %notification.message_id,
                sender = %notification.sender_address,
                subject = %notification.subject,
                urgency = notification.tone.as_ref().map(|t| t.urgency.label()),
                summary = notification.is_summary,
                attachments = notification.attachments.len(),
                "new mail"
            );
            Ok(())
        })
    }

    fn unread_count(&self, count: usize) {
        self.unread.store(count, Ordering::Relaxed);
        debug!(unread = count, "unread count");
    }
}
