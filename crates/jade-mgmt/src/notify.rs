//! Operator notifications.
//!
//! Sending never blocks the caller: the webhook service posts from a spawned
//! task and only logs delivery errors.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// A subject and body sent to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Short summary.
    pub subject: String,
    /// Details.
    pub body: String,
}

/// Delivers operator notifications.
pub trait NotificationService: Send + Sync {
    /// Sends one notification without blocking.
    fn send_notification(&self, subject: &str, body: &str);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotificationService;

impl NotificationService for LogNotificationService {
    fn send_notification(&self, subject: &str, body: &str) {
        tracing::warn!(subject = subject, "{}", body);
    }
}

/// Posts notifications as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotificationService {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotificationService {
    /// Service posting to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl NotificationService for WebhookNotificationService {
    fn send_notification(&self, subject: &str, body: &str) {
        let notification = Notification {
            subject: subject.to_string(),
            body: body.to_string(),
        };
        let client = self.client.clone();
        let url = self.url.clone();
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                tracing::warn!(subject = subject, "no runtime to deliver notification: {}", body);
                return;
            }
        };
        runtime.spawn(async move {
            let result = client
                .post(&url)
                .json(&notification)
                .send()
                .await
                .and_then(|response| response.error_for_status());
            match result {
                Ok(_) => tracing::debug!(url = %url, subject = %notification.subject, "notification delivered"),
                Err(e) => tracing::warn!(url = %url, error = %e, "notification delivery failed"),
            }
        });
    }
}

/// Keeps notifications in memory.
#[derive(Debug, Default)]
pub struct InMemoryNotificationService {
    sent: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationService {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    /// Notifications whose subject contains `needle`.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.subject.contains(needle))
            .count()
    }
}

impl NotificationService for InMemoryNotificationService {
    fn send_notification(&self, subject: &str, body: &str) {
        self.sent.lock().push(Notification {
            subject: subject.to_string(),
            body: body.to_string(),
        });
    }
}
