use thiserror::Error;

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("statement {0} not found")]
    StatementNotFound(String),
    #[error("participant {0} not found")]
    ParticipantNotFound(String),
    #[error("poll {0} not found")]
    PollNotFound(String),
    #[error("a vote for this participant and statement already exists")]
    UniqueViolation,
    #[error("database is busy")]
    Busy,
    #[error("participant already cast the maximum of {0} votes in this poll")]
    VoteLimitReached(i64),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => StoreError::UniqueViolation,
            sqlx::Error::Database(db_err) if is_lock_contention(db_err.code().as_deref()) => StoreError::Busy,
            _ => StoreError::Database(err),
        }
    }
}

impl StoreError {
    /// Contention that a later attempt can get past.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::UniqueViolation | StoreError::Busy)
    }
}

/// Primary SQLite result code of an extended code such as `517` (BUSY_SNAPSHOT).
fn is_lock_contention(code: Option<&str>) -> bool {
    code.and_then(|c| c.parse::<i32>().ok())
        .is_some_and(|c| matches!(c & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

impl From<chrono::ParseError> for StoreError {
    fn from(err: chrono::ParseError) -> Self {
        StoreError::Corrupt(format!("bad timestamp: {}", err))
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid vote value: {0}")]
    InvalidValue(String),
    #[error("vote limit of {0} reached for this poll")]
    VoteLimitReached(i64),
    #[error("could not record vote after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
    #[error(transparent)]
    Storage(StoreError),
}

impl From<StoreError> for VoteError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::StatementNotFound(id) => VoteError::NotFound(format!("statement {}", id)),
            StoreError::ParticipantNotFound(id) => VoteError::NotFound(format!("participant {}", id)),
            StoreError::VoteLimitReached(limit) => VoteError::VoteLimitReached(limit),
            other => VoteError::Storage(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ComputeError {
    #[error("{participants} participants but {rows} matrix rows")]
    RowCount { participants: usize, rows: usize },
    #[error("matrix row {row} has {found} columns, expected {expected}")]
    RaggedMatrix { row: usize, expected: usize, found: usize },
    #[error("matrix contains a non-finite value at ({row}, {col})")]
    NonFinite { row: usize, col: usize },
    #[error("got {labels} cluster labels for {rows} participants")]
    LabelMismatch { labels: usize, rows: usize },
    #[error("clustering failed: {0}")]
    Clustering(String),
    #[error("scoring worker stopped: {0}")]
    Interrupted(String),
}

#[derive(Debug, Error)]
pub enum PollJobError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Compute(#[from] ComputeError),
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("receiver answered {status}")]
    Rejected { status: u16 },
    #[error("invalid webhook secret")]
    InvalidSecret,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}: {reason}")]
    Invalid { name: &'static str, value: String, reason: String },
}
