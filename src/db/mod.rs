mod store;

pub use store::{ScoreStore, VoteStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{migrate::MigrateDatabase, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    format_timestamp, parse_timestamp, CounterDelta, Participant, Poll, PollSnapshot, ScoreStamp, ScoreWrite,
    ScoredStatement, Statement, StatementTally, Vote, VoteOutcome, VoteReceipt, VoteValue,
};

const BUSY_TIMEOUT_SECONDS: u64 = 5;

/// Takes the write lock before the first read, so writers queue on the busy
/// timeout instead of failing a lock upgrade.
const BEGIN_WRITE: &str = "BEGIN IMMEDIATE";

const STATEMENT_COLUMNS: &str = "id, poll_id, text, agree_count, disagree_count, pass_count, gac_score, \
     is_constitutionable, last_calculated_at, scored_revision, deleted, created_at";

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `db_url` and initializes the schema.
    pub async fn new(db_url: &str) -> Result<Self, StoreError> {
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            info!("Creating database at {}", db_url);
            Sqlite::create_database(db_url).await?;
        }

        let options = SqliteConnectOptions::from_str(db_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECONDS));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                community_model_id TEXT NOT NULL,
                title TEXT NOT NULL,
                max_votes_per_participant INTEGER,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS participants (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS statements (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                agree_count INTEGER NOT NULL DEFAULT 0 CHECK (agree_count >= 0),
                disagree_count INTEGER NOT NULL DEFAULT 0 CHECK (disagree_count >= 0),
                pass_count INTEGER NOT NULL DEFAULT 0 CHECK (pass_count >= 0),
                gac_score REAL,
                is_constitutionable BOOLEAN NOT NULL DEFAULT FALSE,
                last_calculated_at TEXT,
                scored_revision INTEGER,
                deleted BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TEXT NOT NULL,
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS votes (
                id TEXT PRIMARY KEY,
                participant_id TEXT NOT NULL,
                statement_id TEXT NOT NULL,
                vote_value TEXT NOT NULL CHECK (vote_value IN ('AGREE', 'DISAGREE', 'PASS')),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                revision INTEGER NOT NULL DEFAULT 0,
                UNIQUE (participant_id, statement_id),
                FOREIGN KEY (participant_id) REFERENCES participants(id),
                FOREIGN KEY (statement_id) REFERENCES statements(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        // Single row; every vote write takes the next value.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_clock (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                revision INTEGER NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;
        sqlx::query("INSERT OR IGNORE INTO ledger_clock (id, revision) VALUES (1, 0);")
            .execute(pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_votes_statement ON votes(statement_id, revision);")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_statements_poll ON statements(poll_id);")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO polls (id, community_model_id, title, max_votes_per_participant, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.community_model_id)
        .bind(&poll.title)
        .bind(poll.max_votes_per_participant)
        .bind(format_timestamp(poll.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Participants are resolved upstream; registering one twice returns the first record.
    pub async fn create_participant(&self, participant_id: &str) -> Result<Participant, StoreError> {
        sqlx::query("INSERT OR IGNORE INTO participants (id, created_at) VALUES (?, ?)")
            .bind(participant_id)
            .bind(format_timestamp(Utc::now()))
            .execute(&self.pool)
            .await?;
        self.get_participant(participant_id).await
    }

    pub async fn get_participant(&self, participant_id: &str) -> Result<Participant, StoreError> {
        let row = sqlx::query("SELECT id, created_at FROM participants WHERE id = ?")
            .bind(participant_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::ParticipantNotFound(participant_id.to_string()))?;

        Ok(Participant {
            id: row.try_get("id")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    pub async fn create_statement(&self, statement: &Statement) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO statements (id, poll_id, text, agree_count, disagree_count, pass_count,
                                    gac_score, is_constitutionable, last_calculated_at, deleted, created_at)
            VALUES (?, ?, ?, 0, 0, 0, NULL, FALSE, NULL, ?, ?)
            "#,
        )
        .bind(&statement.id)
        .bind(&statement.poll_id)
        .bind(&statement.text)
        .bind(statement.deleted)
        .bind(format_timestamp(statement.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Hides a statement from future matrices and votes; its history is kept.
    pub async fn soft_delete_statement(&self, statement_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE statements SET deleted = TRUE WHERE id = ?")
            .bind(statement_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StatementNotFound(statement_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_statement(&self, statement_id: &str) -> Result<Statement, StoreError> {
        let row = sqlx::query(&format!("SELECT {} FROM statements WHERE id = ?", STATEMENT_COLUMNS))
            .bind(statement_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::StatementNotFound(statement_id.to_string()))?;

        statement_from_row(&row)
    }

    pub async fn get_vote(&self, participant_id: &str, statement_id: &str) -> Result<Option<Vote>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, participant_id, statement_id, vote_value, created_at, updated_at, revision
            FROM votes
            WHERE participant_id = ? AND statement_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(statement_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(vote_from_row).transpose()
    }

    pub async fn count_votes(&self, statement_id: &str) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes WHERE statement_id = ?")
            .bind(statement_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn find_vote(
        conn: &mut SqliteConnection,
        participant_id: &str,
        statement_id: &str,
    ) -> Result<Option<(String, VoteValue)>, StoreError> {
        let row = sqlx::query("SELECT id, vote_value FROM votes WHERE participant_id = ? AND statement_id = ?")
            .bind(participant_id)
            .bind(statement_id)
            .fetch_optional(&mut *conn)
            .await?;

        match row {
            Some(row) => {
                let id: String = row.try_get("id")?;
                let value = parse_vote_value(&row.try_get::<String, _>("vote_value")?)?;
                Ok(Some((id, value)))
            }
            None => Ok(None),
        }
    }

    /// Inserts the first vote for a pair or rewrites the existing one in place.
    async fn upsert_vote(
        conn: &mut SqliteConnection,
        existing: Option<(String, VoteValue)>,
        participant_id: &str,
        statement_id: &str,
        value: VoteValue,
        now: DateTime<Utc>,
    ) -> Result<(String, VoteOutcome), StoreError> {
        let stamp = format_timestamp(now);
        match existing {
            Some((vote_id, previous)) if previous == value => Ok((vote_id, VoteOutcome::Unchanged)),
            Some((vote_id, previous)) => {
                let revision = Self::next_revision(conn).await?;
                sqlx::query("UPDATE votes SET vote_value = ?, updated_at = ?, revision = ? WHERE id = ?")
                    .bind(value.as_str())
                    .bind(&stamp)
                    .bind(revision)
                    .bind(&vote_id)
                    .execute(&mut *conn)
                    .await?;
                Ok((vote_id, VoteOutcome::Updated { previous }))
            }
            None => {
                let vote_id = Uuid::new_v4().to_string();
                let revision = Self::next_revision(conn).await?;
                sqlx::query(
                    r#"
                    INSERT INTO votes (id, participant_id, statement_id, vote_value, created_at, updated_at, revision)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&vote_id)
                .bind(participant_id)
                .bind(statement_id)
                .bind(value.as_str())
                .bind(&stamp)
                .bind(&stamp)
                .bind(revision)
                .execute(&mut *conn)
                .await?;
                Ok((vote_id, VoteOutcome::Created))
            }
        }
    }

    /// Advances the ledger clock. Writers hold the write lock, so revisions follow commit order.
    async fn next_revision(conn: &mut SqliteConnection) -> Result<i64, StoreError> {
        let revision: i64 =
            sqlx::query_scalar("UPDATE ledger_clock SET revision = revision + 1 WHERE id = 1 RETURNING revision")
                .fetch_one(&mut *conn)
                .await?;
        Ok(revision)
    }

    async fn adjust_statement_counters(
        conn: &mut SqliteConnection,
        statement_id: &str,
        delta: CounterDelta,
    ) -> Result<StatementTally, StoreError> {
        if !delta.is_zero() {
            sqlx::query(
                r#"
                UPDATE statements
                SET agree_count = agree_count + ?,
                    disagree_count = disagree_count + ?,
                    pass_count = pass_count + ?
                WHERE id = ?
                "#,
            )
            .bind(delta.agree)
            .bind(delta.disagree)
            .bind(delta.pass)
            .bind(statement_id)
            .execute(&mut *conn)
            .await?;
        }

        let row = sqlx::query("SELECT agree_count, disagree_count, pass_count FROM statements WHERE id = ?")
            .bind(statement_id)
            .fetch_one(&mut *conn)
            .await?;

        Ok(StatementTally {
            agree: row.try_get("agree_count")?,
            disagree: row.try_get("disagree_count")?,
            pass: row.try_get("pass_count")?,
        })
    }
}

#[async_trait]
impl VoteStore for Database {
    async fn record_vote(
        &self,
        participant_id: &str,
        statement_id: &str,
        value: VoteValue,
        now: DateTime<Utc>,
    ) -> Result<VoteReceipt, StoreError> {
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;

        let statement = sqlx::query(
            r#"
            SELECT s.poll_id, p.max_votes_per_participant
            FROM statements s
            JOIN polls p ON p.id = s.poll_id
            WHERE s.id = ? AND s.deleted = FALSE
            "#,
        )
        .bind(statement_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| StoreError::StatementNotFound(statement_id.to_string()))?;
        let poll_id: String = statement.try_get("poll_id")?;
        let vote_limit: Option<i64> = statement.try_get("max_votes_per_participant")?;

        let participant_exists = sqlx::query("SELECT 1 FROM participants WHERE id = ?")
            .bind(participant_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        if !participant_exists {
            return Err(StoreError::ParticipantNotFound(participant_id.to_string()));
        }

        let existing = Self::find_vote(&mut tx, participant_id, statement_id).await?;

        if let (None, Some(limit)) = (&existing, vote_limit) {
            let cast: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM votes v
                JOIN statements s ON s.id = v.statement_id
                WHERE v.participant_id = ? AND s.poll_id = ? AND s.deleted = FALSE
                "#,
            )
            .bind(participant_id)
            .bind(&poll_id)
            .fetch_one(&mut *tx)
            .await?;
            if cast >= limit {
                return Err(StoreError::VoteLimitReached(limit));
            }
        }

        let (vote_id, outcome) =
            Self::upsert_vote(&mut tx, existing, participant_id, statement_id, value, now).await?;

        let delta = match outcome {
            VoteOutcome::Created => CounterDelta::for_change(None, value),
            VoteOutcome::Updated { previous } => CounterDelta::for_change(Some(previous), value),
            VoteOutcome::Unchanged => CounterDelta::default(),
        };
        let tally = Self::adjust_statement_counters(&mut tx, statement_id, delta).await?;

        tx.commit().await?;
        debug!(
            "Recorded {} vote {} on statement {} ({:?})",
            value, vote_id, statement_id, outcome
        );

        Ok(VoteReceipt { vote_id, outcome, tally })
    }
}

#[async_trait]
impl ScoreStore for Database {
    async fn polls_with_unscored_activity(&self) -> Result<Vec<String>, StoreError> {
        let polls = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT s.poll_id
            FROM statements s
            JOIN votes v ON v.statement_id = s.id
            WHERE s.deleted = FALSE
              AND (s.scored_revision IS NULL OR v.revision > s.scored_revision)
            ORDER BY s.poll_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(polls)
    }

    async fn get_poll(&self, poll_id: &str) -> Result<Poll, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, community_model_id, title, max_votes_per_participant, created_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::PollNotFound(poll_id.to_string()))?;

        Ok(Poll {
            id: row.try_get("id")?,
            community_model_id: row.try_get("community_model_id")?,
            title: row.try_get("title")?,
            max_votes_per_participant: row.try_get("max_votes_per_participant")?,
            created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        })
    }

    async fn statements_and_votes(&self, poll_id: &str) -> Result<PollSnapshot, StoreError> {
        // One read transaction, so the rows and the clock come from the same snapshot.
        let mut tx = self.pool.begin().await?;

        let revision: i64 = sqlx::query_scalar("SELECT revision FROM ledger_clock WHERE id = 1")
            .fetch_one(&mut *tx)
            .await?;

        let statements = sqlx::query(&format!(
            "SELECT {} FROM statements WHERE poll_id = ? AND deleted = FALSE ORDER BY created_at, id",
            STATEMENT_COLUMNS
        ))
        .bind(poll_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(statement_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        let votes = sqlx::query(
            r#"
            SELECT v.id, v.participant_id, v.statement_id, v.vote_value, v.created_at, v.updated_at, v.revision
            FROM votes v
            JOIN statements s ON s.id = v.statement_id
            WHERE s.poll_id = ? AND s.deleted = FALSE
            ORDER BY v.participant_id, v.statement_id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(vote_from_row)
        .collect::<Result<Vec<_>, _>>()?;

        tx.commit().await?;
        Ok(PollSnapshot { statements, votes, revision })
    }

    async fn write_gac_scores(
        &self,
        scores: &[ScoredStatement],
        stamp: ScoreStamp,
    ) -> Result<Vec<ScoreWrite>, StoreError> {
        let as_of = format_timestamp(stamp.as_of);
        let mut tx = self.pool.begin_with(BEGIN_WRITE).await?;
        let mut writes = Vec::with_capacity(scores.len());

        for scored in scores {
            let row = sqlx::query("SELECT gac_score, is_constitutionable, scored_revision FROM statements WHERE id = ?")
                .bind(&scored.statement_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| StoreError::StatementNotFound(scored.statement_id.clone()))?;

            let previous_score: Option<f64> = row.try_get("gac_score")?;
            let previous_constitutionable: bool = row.try_get("is_constitutionable")?;
            let scored_revision: Option<i64> = row.try_get("scored_revision")?;
            let applied = scored_revision.map_or(true, |last| last <= stamp.revision);

            if applied {
                sqlx::query(
                    r#"
                    UPDATE statements
                    SET gac_score = ?, is_constitutionable = ?, last_calculated_at = ?, scored_revision = ?
                    WHERE id = ?
                    "#,
                )
                .bind(scored.score)
                .bind(scored.constitutionable)
                .bind(&as_of)
                .bind(stamp.revision)
                .bind(&scored.statement_id)
                .execute(&mut *tx)
                .await?;
            }

            writes.push(ScoreWrite {
                statement_id: scored.statement_id.clone(),
                previous_score,
                previous_constitutionable,
                new_score: scored.score,
                constitutionable: scored.constitutionable,
                applied,
            });
        }

        tx.commit().await?;
        Ok(writes)
    }

    async fn reconcile_statement_counters(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE statements
            SET agree_count = (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'AGREE'),
                disagree_count = (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'DISAGREE'),
                pass_count = (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'PASS')
            WHERE agree_count != (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'AGREE')
               OR disagree_count != (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'DISAGREE')
               OR pass_count != (SELECT COUNT(*) FROM votes v WHERE v.statement_id = statements.id AND v.vote_value = 'PASS')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn parse_vote_value(raw: &str) -> Result<VoteValue, StoreError> {
    raw.parse::<VoteValue>()
        .map_err(|_| StoreError::Corrupt(format!("unknown vote value {}", raw)))
}

fn statement_from_row(row: &SqliteRow) -> Result<Statement, StoreError> {
    let last_calculated_at = row
        .try_get::<Option<String>, _>("last_calculated_at")?
        .map(|raw| parse_timestamp(&raw))
        .transpose()?;

    Ok(Statement {
        id: row.try_get("id")?,
        poll_id: row.try_get("poll_id")?,
        text: row.try_get("text")?,
        agree_count: row.try_get("agree_count")?,
        disagree_count: row.try_get("disagree_count")?,
        pass_count: row.try_get("pass_count")?,
        gac_score: row.try_get("gac_score")?,
        is_constitutionable: row.try_get("is_constitutionable")?,
        last_calculated_at,
        scored_revision: row.try_get("scored_revision")?,
        deleted: row.try_get("deleted")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn vote_from_row(row: &SqliteRow) -> Result<Vote, StoreError> {
    Ok(Vote {
        id: row.try_get("id")?,
        participant_id: row.try_get("participant_id")?,
        statement_id: row.try_get("statement_id")?,
        value: parse_vote_value(&row.try_get::<String, _>("vote_value")?)?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
        revision: row.try_get("revision")?,
    })
}
