use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

use super::leases::PollLeases;
use crate::consensus::matrix::OpinionMatrix;
use crate::consensus::{self, changes, GroupDetector, OpinionReducer};
use crate::db::ScoreStore;
use crate::error::{ComputeError, PollJobError, StoreError};
use crate::models::ScoreStamp;
use crate::publisher::{self, PublishSummary};
use crate::webhook::ScoreNotifier;

/// Everything a batch run needs, passed explicitly to each poll job.
#[derive(Clone)]
pub struct ScoringContext {
    pub store: Arc<dyn ScoreStore>,
    pub reducer: Arc<dyn OpinionReducer>,
    pub detector: Arc<dyn GroupDetector>,
    pub notifier: Option<Arc<dyn ScoreNotifier>>,
    pub leases: PollLeases,
    pub threshold: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Published(PublishSummary),
    /// The poll had no votes left on live statements.
    Empty,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub reconciled: u64,
    pub selected: usize,
    pub scored: Vec<String>,
    pub failed: Vec<String>,
    /// Polls skipped because another run still holds them.
    pub busy: Vec<String>,
}

/// Scores one poll. Nothing is written unless every computation step succeeds.
pub async fn score_poll(ctx: &ScoringContext, poll_id: &str) -> Result<PollOutcome, PollJobError> {
    let as_of = Utc::now();
    let poll = ctx.store.get_poll(poll_id).await?;
    let snapshot = ctx.store.statements_and_votes(poll_id).await?;
    // Votes committed after the snapshot carry a higher revision and keep the poll dirty.
    let stamp = ScoreStamp { as_of, revision: snapshot.revision };

    let reducer = Arc::clone(&ctx.reducer);
    let detector = Arc::clone(&ctx.detector);
    let (matrix, result) = tokio::task::spawn_blocking(move || {
        let matrix = OpinionMatrix::build(&snapshot.statements, &snapshot.votes);
        let result = consensus::compute(&matrix, reducer.as_ref(), detector.as_ref());
        (matrix, result)
    })
    .await
    .map_err(|e| ComputeError::Interrupted(e.to_string()))?;
    debug!(
        "Poll {}: {} participants x {} statements",
        poll_id,
        matrix.participant_count(),
        matrix.statement_count()
    );

    let Some(result) = result? else {
        return Ok(PollOutcome::Empty);
    };
    info!(
        "Poll {}: {} group(s) over {} component(s)",
        poll_id, result.group_count, result.components
    );

    let summary = publisher::publish(
        ctx.store.as_ref(),
        poll_id,
        &matrix,
        &result.scores,
        stamp,
        ctx.threshold,
    )
    .await?;

    if let Some(notifier) = &ctx.notifier {
        for event in publisher::build_events(&poll.community_model_id, poll_id, &summary, Utc::now()) {
            // Published scores stand even if nobody hears about them.
            if let Err(e) = notifier.notify(&event).await {
                error!("Failed to deliver {} for poll {}: {}", event.name(), poll_id, e);
            }
        }
    }

    Ok(PollOutcome::Published(summary))
}

/// One pass: repair counters, then score every poll with fresh votes.
///
/// Polls run concurrently; a failing poll is logged and left for the next pass.
pub async fn run_batch(ctx: &ScoringContext) -> Result<BatchReport, StoreError> {
    let mut report = BatchReport::default();

    report.reconciled = ctx.store.reconcile_statement_counters().await?;
    if report.reconciled > 0 {
        warn!("Repaired vote counters on {} statement(s)", report.reconciled);
    }

    let polls = changes::polls_needing_recompute(ctx.store.as_ref()).await?;
    report.selected = polls.len();
    if polls.is_empty() {
        debug!("No polls with unscored activity");
        return Ok(report);
    }
    info!("Found {} poll(s) with unscored activity", polls.len());

    let mut handles = Vec::with_capacity(polls.len());
    for poll_id in polls {
        let Some(lease) = ctx.leases.try_acquire(&poll_id) else {
            debug!("Poll {} is still being scored, skipping", poll_id);
            report.busy.push(poll_id);
            continue;
        };
        let ctx = ctx.clone();
        handles.push((
            poll_id.clone(),
            tokio::spawn(async move {
                let _lease = lease;
                score_poll(&ctx, &poll_id).await
            }),
        ));
    }

    for (poll_id, handle) in handles {
        match handle.await {
            Ok(Ok(_)) => report.scored.push(poll_id),
            Ok(Err(e)) => {
                error!("Error scoring poll {}: {}", poll_id, e);
                report.failed.push(poll_id);
            }
            Err(e) => {
                error!("Scoring task for poll {} panicked: {}", poll_id, e);
                report.failed.push(poll_id);
            }
        }
    }

    Ok(report)
}

/// Starts a batch every `period` without waiting for the previous one.
///
/// A poll still being scored by a slow batch holds its lease, so the next
/// batch reports it as busy instead of scoring it twice.
pub async fn update_gac_scores_task(ctx: ScoringContext, period: Duration) {
    info!("Starting background task to update GAC scores every {:?}...", period);
    let mut interval = interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let ctx = ctx.clone();
        tokio::spawn(async move {
            match run_batch(&ctx).await {
                Ok(report) if report.selected > 0 => info!(
                    "GAC batch done: {} scored, {} failed, {} busy",
                    report.scored.len(),
                    report.failed.len(),
                    report.busy.len()
                ),
                Ok(_) => {}
                Err(e) => error!("GAC batch failed: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::kmeans::KMeans;
    use crate::consensus::pca::Pca;
    use crate::db::{Database, VoteStore};
    use crate::error::{ComputeError, WebhookError};
    use crate::models::{Poll, Statement, VoteValue};
    use crate::webhook::ConsensusEvent;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<ConsensusEvent>>);

    #[async_trait]
    impl ScoreNotifier for Captured {
        async fn notify(&self, event: &ConsensusEvent) -> Result<(), WebhookError> {
            self.0.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ScoreNotifier for Unreachable {
        async fn notify(&self, _event: &ConsensusEvent) -> Result<(), WebhookError> {
            Err(WebhookError::Rejected { status: 503 })
        }
    }

    struct Broken;

    impl OpinionReducer for Broken {
        fn reduce(&self, _matrix: &OpinionMatrix) -> Result<consensus::Reduction, ComputeError> {
            Err(ComputeError::Clustering("degenerate input".to_string()))
        }
    }

    /// Projects like `Pca` but takes long enough for a second batch to start.
    struct Slow;

    impl OpinionReducer for Slow {
        fn reduce(&self, matrix: &OpinionMatrix) -> Result<consensus::Reduction, ComputeError> {
            std::thread::sleep(Duration::from_millis(300));
            Pca.reduce(matrix)
        }
    }

    fn context(db: Arc<Database>, notifier: Option<Arc<dyn ScoreNotifier>>) -> ScoringContext {
        ScoringContext {
            store: db,
            reducer: Arc::new(Pca),
            detector: Arc::new(KMeans::new(42)),
            notifier,
            leases: PollLeases::new(),
            threshold: 0.66,
        }
    }

    /// A poll with one statement that both voters agree with.
    async fn poll_with_votes(db: &Database) -> (Poll, Statement) {
        let poll = Poll::new("model-1".to_string(), "Norms".to_string(), None);
        db.create_poll(&poll).await.unwrap();
        let statement = Statement::new(poll.id.clone(), "Listen first".to_string());
        db.create_statement(&statement).await.unwrap();
        for p in ["ann", "ben"] {
            db.create_participant(p).await.unwrap();
            db.record_vote(p, &statement.id, VoteValue::Agree, Utc::now()).await.unwrap();
        }
        (poll, statement)
    }

    #[tokio::test]
    async fn batch_scores_dirty_polls_and_marks_them_clean() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, statement) = poll_with_votes(&db).await;
        let captured = Arc::new(Captured::default());
        let ctx = context(db.clone(), Some(captured.clone()));

        let report = run_batch(&ctx).await.unwrap();
        assert_eq!(report.scored, vec![poll.id.clone()]);
        assert!(report.failed.is_empty());

        let stored = db.get_statement(&statement.id).await.unwrap();
        // (1 + 2) / (2 + 2)
        assert_eq!(stored.gac_score, Some(0.75));
        assert!(stored.is_constitutionable);

        let events = captured.0.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].model_id(), "model-1");

        let second = run_batch(&ctx).await.unwrap();
        assert_eq!(second.selected, 0);
    }

    #[tokio::test]
    async fn failing_poll_is_left_untouched() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, statement) = poll_with_votes(&db).await;
        let mut ctx = context(db.clone(), None);
        ctx.reducer = Arc::new(Broken);

        let report = run_batch(&ctx).await.unwrap();
        assert_eq!(report.failed, vec![poll.id.clone()]);

        let stored = db.get_statement(&statement.id).await.unwrap();
        assert_eq!(stored.gac_score, None);
        assert_eq!(stored.last_calculated_at, None);
        assert!(!ctx.leases.is_held(&poll.id));
    }

    #[tokio::test]
    async fn leased_poll_is_not_reselected() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, _statement) = poll_with_votes(&db).await;
        let ctx = context(db.clone(), None);

        let lease = ctx.leases.try_acquire(&poll.id).unwrap();
        let report = run_batch(&ctx).await.unwrap();
        assert_eq!(report.busy, vec![poll.id.clone()]);
        assert!(report.scored.is_empty());

        drop(lease);
        let report = run_batch(&ctx).await.unwrap();
        assert_eq!(report.scored, vec![poll.id]);
    }

    #[tokio::test]
    async fn overlapping_batches_do_not_score_the_same_poll_twice() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, _statement) = poll_with_votes(&db).await;
        let captured = Arc::new(Captured::default());
        let mut ctx = context(db.clone(), Some(captured.clone()));
        ctx.reducer = Arc::new(Slow);

        let (first, second) = tokio::join!(run_batch(&ctx), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            run_batch(&ctx).await
        });
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.scored, vec![poll.id.clone()]);
        assert_eq!(second.busy, vec![poll.id.clone()]);
        assert!(second.scored.is_empty());
        assert_eq!(captured.0.lock().unwrap().len(), 2);
        assert!(!ctx.leases.is_held(&poll.id));
    }

    #[tokio::test]
    async fn vote_during_scoring_leaves_the_poll_dirty() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, statement) = poll_with_votes(&db).await;
        let mut ctx = context(db.clone(), None);
        ctx.reducer = Arc::new(Slow);

        let (outcome, _) = tokio::join!(score_poll(&ctx, &poll.id), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            db.create_participant("cat").await.unwrap();
            db.record_vote("cat", &statement.id, VoteValue::Disagree, Utc::now()).await.unwrap();
        });
        outcome.unwrap();

        assert_eq!(db.polls_with_unscored_activity().await.unwrap(), vec![poll.id]);
    }

    #[tokio::test]
    async fn delivery_failure_keeps_published_scores() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (poll, statement) = poll_with_votes(&db).await;
        let ctx = context(db.clone(), Some(Arc::new(Unreachable)));

        let outcome = score_poll(&ctx, &poll.id).await.unwrap();
        assert!(matches!(outcome, PollOutcome::Published(ref s) if s.written == 1));
        assert_eq!(db.get_statement(&statement.id).await.unwrap().gac_score, Some(0.75));
    }

    #[tokio::test]
    async fn batch_repairs_drifted_counters() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let (_poll, statement) = poll_with_votes(&db).await;
        sqlx::query("UPDATE statements SET agree_count = 7 WHERE id = ?")
            .bind(&statement.id)
            .execute(db.pool())
            .await
            .unwrap();

        let report = run_batch(&context(db.clone(), None)).await.unwrap();
        assert_eq!(report.reconciled, 1);
        assert_eq!(db.get_statement(&statement.id).await.unwrap().agree_count, 2);
    }
}
