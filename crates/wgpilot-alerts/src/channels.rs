//! Alert delivery.
//!
//! This module provides the [`AlertSink`] trait and its implementations.
//! Delivery is best effort: sinks log failures and never retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AlertError, Result};
use crate::types::AlertEvent;

/// Result of a successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryResult {
    /// The channel that delivered the event.
    pub channel: String,
    /// Response status code, if the channel speaks HTTP.
    pub status_code: Option<u16>,
}

/// Destination for alert events.
pub trait AlertSink: Send + Sync {
    /// Returns the name of this sink.
    fn name(&self) -> &str;

    /// Delivers `event`. Failures are logged by the sink and swallowed.
    fn dispatch(&self, event: &AlertEvent) -> impl Future<Output = ()> + Send;
}

/// Configuration for a webhook sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// The URL to POST events to. `None` disables delivery.
    pub url: Option<String>,
    /// Timeout for each request.
    pub timeout: Duration,
}

impl WebhookConfig {
    /// Creates a webhook configuration with the default 10 second timeout.
    #[must_use]
    pub fn new(url: Option<String>) -> Self {
        Self {
            url: url.filter(|u| !u.trim().is_empty()),
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Sends events as JSON POST requests.
#[derive(Debug, Clone)]
pub struct WebhookDispatcher {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    /// Creates a dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::InvalidConfig`] if the HTTP client cannot be
    /// built.
    pub fn new(config: WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AlertError::InvalidConfig {
                reason: format!("failed to build http client: {e}"),
            })?;
        Ok(Self { config, client })
    }

    /// Returns the configured URL.
    #[must_use]
    pub fn url(&self) -> Option<&str> {
        self.config.url.as_deref()
    }

    /// POSTs `event` once. 200 and 204 count as delivered.
    ///
    /// # Errors
    ///
    /// Returns [`AlertError::NotConfigured`] without a URL and
    /// [`AlertError::DeliveryFailed`] on transport errors or other statuses.
    pub async fn send(&self, event: &AlertEvent) -> Result<DeliveryResult> {
        let url = self.config.url.as_deref().ok_or(AlertError::NotConfigured)?;

        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| AlertError::DeliveryFailed {
                reason: e.to_string(),
            })?;

        let status = response.status();
        if matches!(status.as_u16(), 200 | 204) {
            Ok(DeliveryResult {
                channel: self.name().to_string(),
                status_code: Some(status.as_u16()),
            })
        } else {
            Err(AlertError::DeliveryFailed {
                reason: format!("HTTP {status}"),
            })
        }
    }
}

impl AlertSink for WebhookDispatcher {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn dispatch(&self, event: &AlertEvent) {
        match self.send(event).await {
            Ok(result) => info!(
                peer = %event.peer_name,
                status = ?result.status_code,
                details = %event.details,
                "alert sent"
            ),
            Err(AlertError::NotConfigured) => {
                debug!(peer = %event.peer_name, "no webhook configured, alert not sent");
            }
            Err(e) => warn!(peer = %event.peer_name, error = %e, "failed to send alert"),
        }
    }
}

/// Keeps events in memory. Used in tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<AlertEvent>>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event received so far.
    #[must_use]
    pub fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().clone()
    }
}

impl AlertSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn dispatch(&self, event: &AlertEvent) {
        info!(peer = %event.peer_name, details = %event.details, "alert recorded");
        self.events.lock().push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertSeverity, UNUSUAL_TRAFFIC};
    use chrono::Utc;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn event() -> AlertEvent {
        AlertEvent {
            event: UNUSUAL_TRAFFIC.to_string(),
            peer_name: "laptop".to_string(),
            peer_ip: Ipv4Addr::new(10, 0, 0, 2),
            details: "Downloaded 12.00GB in the last hour".to_string(),
            timestamp: Utc::now(),
            severity: AlertSeverity::Warning,
            rx_bytes: 12,
            tx_bytes: 0,
        }
    }

    /// Serves a single request with `status` and hands back its body.
    async fn one_shot_server(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let body = loop {
                let n = socket.read(&mut chunk).await.expect("read");
                if n == 0 {
                    break String::new();
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if body.len() >= length {
                        break body.to_string();
                    }
                }
            };
            let response =
                format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.expect("write");
            let _ = tx.send(body);
        });

        (format!("http://{addr}/hook"), rx)
    }

    #[tokio::test]
    async fn send_posts_json_payload() {
        let (url, body) = one_shot_server("204 No Content").await;
        let dispatcher = WebhookDispatcher::new(WebhookConfig::new(Some(url))).expect("client");

        let result = dispatcher.send(&event()).await.expect("delivered");
        assert_eq!(result.status_code, Some(204));

        let body: serde_json::Value =
            serde_json::from_str(&body.await.expect("body")).expect("json");
        assert_eq!(body["event"], "unusual_traffic");
        assert_eq!(body["peer_name"], "laptop");
        assert_eq!(body["peer_ip"], "10.0.0.2");
        assert_eq!(body["severity"], "warning");
    }

    #[tokio::test]
    async fn server_error_is_delivery_failure() {
        let (url, _body) = one_shot_server("500 Internal Server Error").await;
        let dispatcher = WebhookDispatcher::new(WebhookConfig::new(Some(url))).expect("client");

        let err = dispatcher.send(&event()).await.expect_err("500");
        assert!(matches!(err, AlertError::DeliveryFailed { .. }));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn missing_url_is_not_configured() {
        let dispatcher = WebhookDispatcher::new(WebhookConfig::new(Some("  ".to_string())))
            .expect("client");
        assert!(dispatcher.url().is_none());
        assert!(matches!(
            dispatcher.send(&event()).await,
            Err(AlertError::NotConfigured)
        ));
        // Swallowed.
        dispatcher.dispatch(&event()).await;
    }

    #[tokio::test]
    async fn unreachable_url_is_swallowed_by_dispatch() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            listener.local_addr().expect("addr").port()
        };
        let config = WebhookConfig::new(Some(format!("http://127.0.0.1:{port}/hook")))
            .with_timeout(Duration::from_secs(2));
        let dispatcher = WebhookDispatcher::new(config).expect("client");

        assert!(dispatcher.send(&event()).await.is_err());
        dispatcher.dispatch(&event()).await;
    }

    #[tokio::test]
    async fn memory_sink_records() {
        let sink = MemorySink::new();
        sink.dispatch(&event()).await;
        assert_eq!(sink.events().len(), 1);
        assert_eq!(sink.name(), "memory");
    }
}
