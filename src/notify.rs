//! Best-effort operator notifications.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{error, info, warn};

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(severity: Severity, message: impl Into<String>, context: Value) -> Self {
        Self {
            severity,
            message: message.into(),
            context,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: Notification) -> Result<()>;
}

/// Hand a notification off without waiting for delivery. Failures are logged only.
pub fn dispatch(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = notifier.clone();
    tokio::spawn(async move {
        let severity = notification.severity;
        if let Err(e) = notifier.notify(notification).await {
            warn!(%severity, error = %e, "notification delivery failed");
        }
    });
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: Notification) -> Result<()> {
        match n.severity {
            Severity::Info => info!(context = %n.context, "{}", n.message),
            Severity::Warning => warn!(context = %n.context, "{}", n.message),
            Severity::Error => error!(context = %n.context, "{}", n.message),
        }
        Ok(())
    }
}

/// POSTs notifications as JSON to a webhook.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("battery-fleet-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: Notification) -> Result<()> {
        // Mirror to the log so the operator trail is complete even if delivery fails
        LogNotifier.notify(n.clone()).await?;
        self.client
            .post(&self.url)
            .json(&n)
            .send()
            .await
            .context("webhook request failed")?
            .error_for_status()
            .context("webhook rejected notification")?;
        Ok(())
    }
}

/// Collects notifications in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    sent: parking_lot::Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, n: Notification) -> Result<()> {
        self.sent.lock().push(n);
        Ok(())
    }
}

pub fn build(cfg: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match cfg.webhook_url.as_deref().filter(|_| cfg.enabled) {
        Some(url) => {
            info!(url, "notifications delivered to webhook");
            Ok(Arc::new(WebhookNotifier::new(
                url,
                Duration::from_secs(cfg.timeout_secs),
            )?))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_json_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_partial_json(json!({
                "severity": "error",
                "message": "battery 2 offline",
                "context": {"device_id": 2}
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(format!("{}/hook", server.uri()), Duration::from_secs(2)).unwrap();
        notifier
            .notify(Notification::new(
                Severity::Error,
                "battery 2 offline",
                json!({"device_id": 2}),
            ))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_surfaces_http_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(server.uri(), Duration::from_secs(2)).unwrap();
        let res = notifier
            .notify(Notification::new(Severity::Info, "hello", Value::Null))
            .await;
        assert!(res.is_err());
    }

    #[test]
    fn severity_parses_case_insensitively() {
        assert_eq!("WARNING".parse::<Severity>().unwrap(), Severity::Warning);
        assert_eq!(Severity::Error.to_string(), "error");
    }
}
