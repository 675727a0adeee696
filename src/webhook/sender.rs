use async_trait::async_trait;
use log::{info, warn};
use reqwest::header::CONTENT_TYPE;
use std::time::Duration;

use super::{sign, ConsensusEvent, ScoreNotifier, SIGNATURE_HEADER};
use crate::config::WebhookConfig;
use crate::error::WebhookError;

const REQUEST_TIMEOUT_SECONDS: u64 = 10;
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 500;

/// Posts signed events to a single receiver.
pub struct WebhookSender {
    client: reqwest::Client,
    url: String,
    secret: String,
    max_attempts: u32,
    backoff: Duration,
}

impl WebhookSender {
    pub fn new(config: &WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECONDS))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
            secret: config.secret.clone(),
            max_attempts: MAX_ATTEMPTS,
            backoff: Duration::from_millis(BASE_BACKOFF_MS),
        })
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Builds the POST; the signature covers exactly the bytes sent.
    fn request(&self, event: &ConsensusEvent) -> Result<reqwest::Request, WebhookError> {
        let body = serde_json::to_vec(event)?;
        let signature = sign(&body, &self.secret)?;
        Ok(self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(body)
            .build()?)
    }

    async fn send_once(&self, event: &ConsensusEvent) -> Result<(), WebhookError> {
        let response = self.client.execute(self.request(event)?).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(WebhookError::Rejected { status: status.as_u16() })
        }
    }
}

#[async_trait]
impl ScoreNotifier for WebhookSender {
    async fn notify(&self, event: &ConsensusEvent) -> Result<(), WebhookError> {
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.send_once(event).await {
                Ok(()) => {
                    info!("Delivered {} webhook for model {}", event.name(), event.model_id());
                    return Ok(());
                }
                Err(e @ (WebhookError::Serialize(_) | WebhookError::InvalidSecret)) => return Err(e),
                Err(e) => {
                    warn!(
                        "Webhook delivery of {} failed (attempt {}/{}): {}",
                        event.name(),
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or(WebhookError::Rejected { status: 0 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::webhook::{verify, ScoreChange};
    use chrono::Utc;

    fn event() -> ConsensusEvent {
        ConsensusEvent::GacScoresUpdated {
            model_id: "model-1".to_string(),
            poll_id: Some("poll-1".to_string()),
            changed_statements: vec![ScoreChange {
                statement_id: "s1".to_string(),
                old_score: Some(0.25),
                new_score: 0.75,
            }],
            timestamp: Some(Utc::now()),
        }
    }

    fn sender(url: &str) -> WebhookSender {
        WebhookSender::new(&WebhookConfig {
            url: url.to_string(),
            secret: "s3cret".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn request_is_signed_over_exact_body() {
        let request = sender("http://127.0.0.1:9/hook").request(&event()).unwrap();
        let signature = request.headers()[SIGNATURE_HEADER].to_str().unwrap().to_string();
        let body = std::str::from_utf8(request.body().unwrap().as_bytes().unwrap()).unwrap().to_string();

        let received = verify(Some(&signature), &body, "s3cret", Duration::from_secs(300), Utc::now()).unwrap();
        assert_eq!(received.model_id(), "model-1");
        assert_eq!(received.name(), "gac_scores_updated");
    }

    #[tokio::test]
    async fn unreachable_receiver_fails_after_retries() {
        // Port 9 (discard) is closed on test hosts.
        let sender = sender("http://127.0.0.1:9/hook").with_retry_policy(2, Duration::from_millis(1));
        let err = sender.notify(&event()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Http(_)));
    }
}
