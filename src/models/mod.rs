use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::VoteError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Poll {
    pub id: String,
    pub community_model_id: String,
    pub title: String,
    pub max_votes_per_participant: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub poll_id: String,
    pub text: String,
    pub agree_count: i64,
    pub disagree_count: i64,
    pub pass_count: i64,
    pub gac_score: Option<f64>,
    pub is_constitutionable: bool,
    pub last_calculated_at: Option<DateTime<Utc>>,
    /// Ledger revision the current score was computed from.
    pub scored_revision: Option<i64>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteValue {
    Agree,
    Disagree,
    Pass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub id: String,
    pub participant_id: String,
    pub statement_id: String,
    pub value: VoteValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Ledger revision of the last write to this row.
    pub revision: i64,
}

/// One poll's live statements and votes, read in a single transaction.
#[derive(Debug, Clone, Default)]
pub struct PollSnapshot {
    pub statements: Vec<Statement>,
    pub votes: Vec<Vote>,
    /// Every vote with a higher revision committed after this read.
    pub revision: i64,
}

/// When a score was computed and which ledger state it reflects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreStamp {
    pub as_of: DateTime<Utc>,
    pub revision: i64,
}

/// Live counters shown next to a statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementTally {
    pub agree: i64,
    pub disagree: i64,
    pub pass: i64,
}

/// Signed adjustment applied to a statement's three counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterDelta {
    pub agree: i64,
    pub disagree: i64,
    pub pass: i64,
}

/// Score computed for one statement during a batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredStatement {
    pub statement_id: String,
    pub score: f64,
    pub constitutionable: bool,
}

/// Result of writing one score back to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreWrite {
    pub statement_id: String,
    pub previous_score: Option<f64>,
    pub previous_constitutionable: bool,
    pub new_score: f64,
    pub constitutionable: bool,
    /// False when the stored score already reflects a later ledger revision.
    pub applied: bool,
}

/// How a vote write changed the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Created,
    Updated { previous: VoteValue },
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VoteReceipt {
    pub vote_id: String,
    pub outcome: VoteOutcome,
    pub tally: StatementTally,
}

impl VoteValue {
    pub const ALL: [VoteValue; 3] = [VoteValue::Agree, VoteValue::Disagree, VoteValue::Pass];

    pub fn as_str(&self) -> &'static str {
        match self {
            VoteValue::Agree => "AGREE",
            VoteValue::Disagree => "DISAGREE",
            VoteValue::Pass => "PASS",
        }
    }

    /// Matrix encoding: agree +1, disagree -1, pass 0.
    pub fn weight(&self) -> f64 {
        match self {
            VoteValue::Agree => 1.0,
            VoteValue::Disagree => -1.0,
            VoteValue::Pass => 0.0,
        }
    }
}

impl fmt::Display for VoteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoteValue {
    type Err = VoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AGREE" => Ok(VoteValue::Agree),
            "DISAGREE" => Ok(VoteValue::Disagree),
            "PASS" => Ok(VoteValue::Pass),
            _ => Err(VoteError::InvalidValue(s.to_string())),
        }
    }
}

impl CounterDelta {
    /// Delta for moving a vote from `previous` (or nothing) to `next`.
    pub fn for_change(previous: Option<VoteValue>, next: VoteValue) -> Self {
        let mut delta = CounterDelta::default();
        if previous == Some(next) {
            return delta;
        }
        if let Some(old) = previous {
            *delta.slot(old) -= 1;
        }
        *delta.slot(next) += 1;
        delta
    }

    pub fn is_zero(&self) -> bool {
        self.agree == 0 && self.disagree == 0 && self.pass == 0
    }

    fn slot(&mut self, value: VoteValue) -> &mut i64 {
        match value {
            VoteValue::Agree => &mut self.agree,
            VoteValue::Disagree => &mut self.disagree,
            VoteValue::Pass => &mut self.pass,
        }
    }
}

impl Poll {
    pub fn new(community_model_id: String, title: String, max_votes_per_participant: Option<i64>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            community_model_id,
            title,
            max_votes_per_participant,
            created_at: Utc::now(),
        }
    }
}

impl Statement {
    pub fn new(poll_id: String, text: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            poll_id,
            text,
            agree_count: 0,
            disagree_count: 0,
            pass_count: 0,
            gac_score: None,
            is_constitutionable: false,
            last_calculated_at: None,
            scored_revision: None,
            deleted: false,
            created_at: Utc::now(),
        }
    }

    pub fn tally(&self) -> StatementTally {
        StatementTally {
            agree: self.agree_count,
            disagree: self.disagree_count,
            pass: self.pass_count,
        }
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexically.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vote_values_case_insensitively() {
        assert_eq!("agree".parse::<VoteValue>().unwrap(), VoteValue::Agree);
        assert_eq!("DISAGREE".parse::<VoteValue>().unwrap(), VoteValue::Disagree);
        assert_eq!(" Pass ".parse::<VoteValue>().unwrap(), VoteValue::Pass);
        assert!(matches!("maybe".parse::<VoteValue>(), Err(VoteError::InvalidValue(v)) if v == "maybe"));
    }

    #[test]
    fn delta_for_first_vote_increments_only() {
        let delta = CounterDelta::for_change(None, VoteValue::Pass);
        assert_eq!(delta, CounterDelta { agree: 0, disagree: 0, pass: 1 });
    }

    #[test]
    fn delta_for_revote_moves_one_count() {
        let delta = CounterDelta::for_change(Some(VoteValue::Agree), VoteValue::Disagree);
        assert_eq!(delta, CounterDelta { agree: -1, disagree: 1, pass: 0 });
    }

    #[test]
    fn delta_for_same_value_is_zero() {
        for value in VoteValue::ALL {
            assert!(CounterDelta::for_change(Some(value), value).is_zero());
        }
    }

    #[test]
    fn timestamps_sort_lexically() {
        let early = parse_timestamp("2024-01-01T10:00:00Z").unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        assert!(format_timestamp(early) < format_timestamp(late));
        assert_eq!(parse_timestamp(&format_timestamp(late)).unwrap(), late);
    }
}
