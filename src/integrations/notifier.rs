use async_trait::async_trait;
use serde_json::json;

use super::{Notification, Notifier, classify_status, classify_transport};
use crate::errors::StageError;

/// Hands notifications to an HTTP mail relay as JSON
/// (`{from, to, subject, text}`), bearer-authenticated when a token is set.
#[derive(Clone)]
pub struct RelayNotifier {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    from: String,
}

impl RelayNotifier {
    pub fn new(url: impl Into<String>, token: Option<String>, from: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
            token,
            from: from.into(),
        }
    }
}

#[async_trait]
impl Notifier for RelayNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), StageError> {
        if notification.recipients.is_empty() {
            tracing::debug!(subject = %notification.subject, "no recipients configured, skipping email");
            return Ok(());
        }
        let mut req = self.http.post(&self.url).json(&json!({
            "from": self.from,
            "to": notification.recipients,
            "subject": notification.subject,
            "text": notification.body,
        }));
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport(&e, "mail relay"))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, "mail relay", &body));
        }
        tracing::info!(
            recipients = notification.recipients.len(),
            subject = %notification.subject,
            "notification sent"
        );
        Ok(())
    }
}

/// Used when no relay is configured: logs the notification and succeeds.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), StageError> {
        tracing::info!(
            recipients = ?notification.recipients,
            subject = %notification.subject,
            "notification (log only, no relay configured)"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(recipients: Vec<String>) -> Notification {
        Notification {
            subject: "[Watchman] acme/api: 1 finding".into(),
            body: "body".into(),
            recipients,
        }
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        assert!(LogNotifier.notify(&notification(vec!["a@b.c".into()])).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_without_recipients_is_a_no_op() {
        // Unroutable URL: would fail if a request were attempted.
        let relay = RelayNotifier::new("http://127.0.0.1:9/send", None, "watchman@localhost");
        assert!(relay.notify(&notification(vec![])).await.is_ok());
    }

    #[tokio::test]
    async fn test_relay_connection_failure_is_transient() {
        let relay = RelayNotifier::new("http://127.0.0.1:9/send", None, "watchman@localhost");
        let err = relay
            .notify(&notification(vec!["sec@acme.io".into()]))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{}", err);
    }
}
