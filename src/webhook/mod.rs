mod sender;

pub use sender::WebhookSender;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::error::Error;
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;
use crate::error::WebhookError;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreChange {
    pub statement_id: String,
    pub old_score: Option<f64>,
    pub new_score: f64,
}

/// Payloads exchanged with external consensus services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConsensusEvent {
    #[serde(rename_all = "camelCase")]
    GacScoresUpdated {
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_id: Option<String>,
        changed_statements: Vec<ScoreChange>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
    #[serde(rename_all = "camelCase")]
    StatementsChanged {
        model_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },
}

const KNOWN_EVENTS: [&str; 2] = ["gac_scores_updated", "statements_changed"];

impl ConsensusEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConsensusEvent::GacScoresUpdated { .. } => KNOWN_EVENTS[0],
            ConsensusEvent::StatementsChanged { .. } => KNOWN_EVENTS[1],
        }
    }

    pub fn model_id(&self) -> &str {
        match self {
            ConsensusEvent::GacScoresUpdated { model_id, .. } | ConsensusEvent::StatementsChanged { model_id, .. } => {
                model_id
            }
        }
    }

    fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ConsensusEvent::GacScoresUpdated { timestamp, .. } | ConsensusEvent::StatementsChanged { timestamp, .. } => {
                *timestamp
            }
        }
    }
}

/// Why an incoming webhook was refused. Nothing is acted on in any of these cases.
#[derive(Debug, Error, PartialEq)]
pub enum WebhookRejection {
    #[error("Missing signature")]
    MissingSignature,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Webhook timestamp too old")]
    StaleTimestamp,
    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(String),
    #[error("Unknown event type: {0}")]
    UnknownEvent(String),
}

impl WebhookRejection {
    pub fn status(&self) -> u16 {
        match self {
            WebhookRejection::MissingSignature
            | WebhookRejection::InvalidSignature
            | WebhookRejection::StaleTimestamp => 401,
            WebhookRejection::InvalidPayload(_) | WebhookRejection::UnknownEvent(_) => 400,
        }
    }
}

/// Hex HMAC-SHA256 of the exact body bytes.
pub fn sign(body: &[u8], secret: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookError::InvalidSecret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks the signature, then parses the payload.
///
/// The signature is verified over the raw body before any parsing, in
/// constant time.
pub fn verify(
    signature: Option<&str>,
    raw_body: &str,
    secret: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<ConsensusEvent, WebhookRejection> {
    let signature = signature.ok_or(WebhookRejection::MissingSignature)?;
    let provided = hex::decode(signature.trim()).map_err(|_| WebhookRejection::InvalidSignature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| WebhookRejection::InvalidSignature)?;
    mac.update(raw_body.as_bytes());
    mac.verify_slice(&provided).map_err(|_| WebhookRejection::InvalidSignature)?;

    let value: Value =
        serde_json::from_str(raw_body).map_err(|e| WebhookRejection::InvalidPayload(e.to_string()))?;
    let event_name = value
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| WebhookRejection::InvalidPayload("missing event".to_string()))?;
    if !KNOWN_EVENTS.contains(&event_name) {
        return Err(WebhookRejection::UnknownEvent(event_name.to_string()));
    }

    let event: ConsensusEvent =
        serde_json::from_value(value).map_err(|e| WebhookRejection::InvalidPayload(e.to_string()))?;
    // A timestamp ahead of our clock has no age.
    if let Some(Ok(age)) = event.timestamp().map(|sent_at| (now - sent_at).to_std()) {
        if age > max_age {
            return Err(WebhookRejection::StaleTimestamp);
        }
    }
    Ok(event)
}

/// Sending side: delivers events produced by a batch run.
#[async_trait]
pub trait ScoreNotifier: Send + Sync {
    async fn notify(&self, event: &ConsensusEvent) -> Result<(), WebhookError>;
}

/// Receiving side of the webhook.
#[async_trait]
pub trait ConsensusEventHandler: Send + Sync {
    async fn handle(&self, event: ConsensusEvent) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    pub status: u16,
    pub body: Value,
}

/// Verifies an incoming request and hands the event to `handler`.
pub async fn dispatch(
    handler: &dyn ConsensusEventHandler,
    signature: Option<&str>,
    raw_body: &str,
    secret: &str,
    max_age: Duration,
    now: DateTime<Utc>,
) -> WebhookResponse {
    let event = match verify(signature, raw_body, secret, max_age, now) {
        Ok(event) => event,
        Err(rejection) => {
            warn!("Rejected webhook: {}", rejection);
            return WebhookResponse {
                status: rejection.status(),
                body: json!({ "error": rejection.to_string() }),
            };
        }
    };

    let name = event.name();
    match handler.handle(event).await {
        Ok(()) => WebhookResponse {
            status: 200,
            body: json!({ "success": true }),
        },
        Err(e) => {
            error!("Error processing {} webhook: {}", name, e);
            WebhookResponse {
                status: 500,
                body: json!({ "error": e.to_string() }),
            }
        }
    }
}

/// Shared secret and freshness window for incoming webhooks.
#[derive(Debug, Clone)]
pub struct WebhookReceiver {
    secret: String,
    max_age: Duration,
}

impl WebhookReceiver {
    pub fn new(secret: impl Into<String>, max_age: Duration) -> Self {
        Self {
            secret: secret.into(),
            max_age,
        }
    }

    /// `None` when no webhook secret is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        config
            .webhook
            .as_ref()
            .map(|webhook| Self::new(webhook.secret.clone(), config.webhook_max_age))
    }

    pub async fn receive(
        &self,
        handler: &dyn ConsensusEventHandler,
        signature: Option<&str>,
        raw_body: &str,
    ) -> WebhookResponse {
        dispatch(handler, signature, raw_body, &self.secret, self.max_age, Utc::now()).await
    }
}
