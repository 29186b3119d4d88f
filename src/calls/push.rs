//! Wake-up pushes for devices whose socket may be suspended.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::json;

use crate::{config::PushConfig, presence::ConnectionId};

/// Data carried by a high-priority wake push.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WakePayload {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub sender_id: ConnectionId,
    pub room_id: String,
}

impl WakePayload {
    pub fn call_request(sender_id: ConnectionId, room_id: impl Into<String>) -> Self {
        Self {
            kind: "call-request",
            sender_id,
            room_id: room_id.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PushError {
    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("push gateway answered {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait PushNotifier: Send + Sync {
    async fn notify(&self, token: &str, payload: &WakePayload) -> Result<(), PushError>;
}

/// Posts FCM-style messages to a configured gateway.
pub struct HttpPushNotifier {
    client: Client,
    endpoint: String,
    server_key: Option<String>,
}

impl HttpPushNotifier {
    pub fn new(endpoint: String, server_key: Option<String>, timeout: Duration) -> Result<Self, PushError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint,
            server_key,
        })
    }
}

#[async_trait]
impl PushNotifier for HttpPushNotifier {
    async fn notify(&self, token: &str, payload: &WakePayload) -> Result<(), PushError> {
        let body = json!({
            "to": token,
            "priority": "high",
            "data": payload,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.server_key {
            request = request.header(reqwest::header::AUTHORIZATION, format!("key={key}"));
        }

        let status = request.send().await?.status();
        if !status.is_success() {
            return Err(PushError::Rejected(status.as_u16()));
        }
        Ok(())
    }
}

/// Used when no push gateway is configured.
pub struct DisabledPushNotifier;

#[async_trait]
impl PushNotifier for DisabledPushNotifier {
    async fn notify(&self, _token: &str, payload: &WakePayload) -> Result<(), PushError> {
        tracing::debug!(room = %payload.room_id, "push disabled, not waking device");
        Ok(())
    }
}

pub fn from_config(config: &PushConfig) -> Result<Arc<dyn PushNotifier>, PushError> {
    match &config.endpoint {
        Some(endpoint) => {
            tracing::info!(%endpoint, "push notifications enabled");
            let notifier = HttpPushNotifier::new(
                endpoint.clone(),
                config.server_key.clone(),
                Duration::from_secs(config.timeout_seconds),
            )?;
            Ok(Arc::new(notifier))
        }
        None => {
            tracing::warn!("no push endpoint configured, suspended devices will not be woken");
            Ok(Arc::new(DisabledPushNotifier))
        }
    }
}
