use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{Poll, PollSnapshot, ScoreStamp, ScoreWrite, ScoredStatement, VoteReceipt, VoteValue};

/// Write side used by the vote ledger.
#[async_trait]
pub trait VoteStore: Send + Sync {
    /// One transactional attempt at `upsert_vote` + `adjust_statement_counters`.
    ///
    /// Returns `StoreError::UniqueViolation` when a concurrent first vote for the
    /// same pair committed first, and `StoreError::Busy` when the write lock could
    /// not be taken in time. Nothing is written in either case.
    async fn record_vote(
        &self,
        participant_id: &str,
        statement_id: &str,
        value: VoteValue,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt, StoreError>;
}

/// Read/write side used by the batch scorer.
#[async_trait]
pub trait ScoreStore: Send + Sync {
    /// Polls with a non-deleted statement that has a vote written at a later
    /// ledger revision than its score reflects (or never scored).
    async fn polls_with_unscored_activity(&self) -> Result<Vec<String>, StoreError>;

    async fn get_poll(&self, poll_id: &str) -> Result<Poll, StoreError>;

    /// Non-deleted statements of the poll, every vote on them, and the ledger
    /// revision they were read at.
    async fn statements_and_votes(&self, poll_id: &str) -> Result<PollSnapshot, StoreError>;

    /// Writes all scores in one transaction, stamping `last_calculated_at` and
    /// the scored revision. Rows already scored at a later revision are left alone.
    async fn write_gac_scores(&self, scores: &[ScoredStatement], stamp: ScoreStamp) -> Result<Vec<ScoreWrite>, StoreError>;

    /// Recomputes counters from vote rows where they drifted. Returns the number of repaired statements.
    async fn reconcile_statement_counters(&self) -> Result<u64, StoreError>;
}
