use chrono::Utc;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::db::VoteStore;
use crate::error::{StoreError, VoteError};
use crate::models::{VoteReceipt, VoteValue};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 50;

/// Records votes and keeps statement counters in step with them.
pub struct VoteLedger {
    store: Arc<dyn VoteStore>,
    max_attempts: u32,
    backoff: Duration,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn VoteStore>) -> Self {
        Self {
            store,
            max_attempts: MAX_ATTEMPTS,
            backoff: Duration::from_millis(BASE_BACKOFF_MS),
        }
    }

    pub fn with_retry_policy(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    /// Casts `raw_value` ("AGREE", "DISAGREE" or "PASS") for the participant.
    pub async fn cast_vote_str(
        &self,
        participant_id: &str,
        statement_id: &str,
        raw_value: &str,
    ) -> Result<VoteReceipt, VoteError> {
        let value: VoteValue = raw_value.parse()?;
        self.cast_vote(participant_id, statement_id, value).await
    }

    /// Inserts, updates or leaves alone the participant's vote on the statement.
    ///
    /// A first vote that loses an insert race is retried; the retry sees the
    /// winner's row and takes the update path. A write lock that stays busy past
    /// the store's timeout is retried the same way.
    pub async fn cast_vote(
        &self,
        participant_id: &str,
        statement_id: &str,
        value: VoteValue,
    ) -> Result<VoteReceipt, VoteError> {
        for attempt in 1..=self.max_attempts {
            match self
                .store
                .record_vote(participant_id, statement_id, value, Utc::now())
                .await
            {
                Ok(receipt) => {
                    if attempt > 1 {
                        info!(
                            "Vote by {} on {} recorded after {} attempts",
                            participant_id, statement_id, attempt
                        );
                    }
                    return Ok(receipt);
                }
                Err(e) if e.is_transient() => {
                    warn!(
                        "Vote by {} on {} not recorded: {} (attempt {}/{})",
                        participant_id, statement_id, e, attempt, self.max_attempts
                    );
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        error!(
            "Giving up on vote by {} on {} after {} attempts",
            participant_id, statement_id, self.max_attempts
        );
        Err(VoteError::RetriesExhausted { attempts: self.max_attempts })
    }
}
