use chrono::{DateTime, Utc};
use log::{debug, info};

use crate::consensus::gac;
use crate::consensus::matrix::OpinionMatrix;
use crate::db::ScoreStore;
use crate::error::StoreError;
use crate::models::{ScoreStamp, ScoredStatement};
use crate::webhook::{ConsensusEvent, ScoreChange};

/// What a publish actually changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishSummary {
    /// Statements whose stored score differs from before this run.
    pub changes: Vec<ScoreChange>,
    /// True when the poll's set of constitutionable statements changed.
    pub constitutionable_changed: bool,
    pub written: usize,
    /// Rows already scored from a later ledger revision and left untouched.
    pub skipped: usize,
}

impl PublishSummary {
    pub fn is_quiet(&self) -> bool {
        self.changes.is_empty() && !self.constitutionable_changed
    }
}

/// Persists `scores` (indexed like the matrix columns) under `stamp`.
///
/// Columns without any vote get no score. Statements outside the matrix are
/// never touched.
pub async fn publish(
    store: &dyn ScoreStore,
    poll_id: &str,
    matrix: &OpinionMatrix,
    scores: &[f64],
    stamp: ScoreStamp,
    threshold: f64,
) -> Result<PublishSummary, StoreError> {
    let scored: Vec<ScoredStatement> = matrix
        .statements()
        .iter()
        .zip(scores)
        .enumerate()
        .filter(|(col, _)| matrix.has_votes(*col))
        .map(|(_, (statement_id, score))| ScoredStatement {
            statement_id: statement_id.clone(),
            score: *score,
            constitutionable: gac::is_constitutionable(*score, threshold),
        })
        .collect();

    if scored.is_empty() {
        debug!("Nothing to publish for poll {}", poll_id);
        return Ok(PublishSummary::default());
    }

    let writes = store.write_gac_scores(&scored, stamp).await?;

    let mut summary = PublishSummary::default();
    for write in writes {
        if !write.applied {
            summary.skipped += 1;
            continue;
        }
        summary.written += 1;
        if write.previous_score != Some(write.new_score) {
            summary.changes.push(ScoreChange {
                statement_id: write.statement_id,
                old_score: write.previous_score,
                new_score: write.new_score,
            });
        }
        if write.previous_constitutionable != write.constitutionable {
            summary.constitutionable_changed = true;
        }
    }

    info!(
        "Published {} GAC score(s) for poll {} ({} changed, {} skipped)",
        summary.written,
        poll_id,
        summary.changes.len(),
        summary.skipped
    );
    Ok(summary)
}

/// Events announcing a publish; empty when nothing observable changed.
pub fn build_events(
    model_id: &str,
    poll_id: &str,
    summary: &PublishSummary,
    now: DateTime<Utc>,
) -> Vec<ConsensusEvent> {
    let mut events = Vec::new();
    if !summary.changes.is_empty() {
        events.push(ConsensusEvent::GacScoresUpdated {
            model_id: model_id.to_string(),
            poll_id: Some(poll_id.to_string()),
            changed_statements: summary.changes.clone(),
            timestamp: Some(now),
        });
    }
    if summary.constitutionable_changed {
        events.push(ConsensusEvent::StatementsChanged {
            model_id: model_id.to_string(),
            poll_id: Some(poll_id.to_string()),
            timestamp: Some(now),
        });
    }
    events
}
