use std::collections::{BTreeSet, HashMap};

use crate::error::ComputeError;
use crate::models::{Statement, Vote};

/// Dense participant x statement matrix: agree +1, disagree -1, pass or no vote 0.
///
/// Row `i` belongs to `participants()[i]` and column `j` to `statements()[j]`;
/// label and score vectors produced downstream use the same indices.
#[derive(Debug, Clone, PartialEq)]
pub struct OpinionMatrix {
    participants: Vec<String>,
    statements: Vec<String>,
    rows: Vec<Vec<f64>>,
    votes_per_statement: Vec<usize>,
}

impl OpinionMatrix {
    /// Builds the matrix for one poll.
    ///
    /// Columns follow the order of `statements` (deleted ones are skipped);
    /// rows are the distinct voters sorted by id. Votes on statements outside
    /// the list are ignored.
    pub fn build(statements: &[Statement], votes: &[Vote]) -> Self {
        let statement_ids: Vec<String> = statements
            .iter()
            .filter(|s| !s.deleted)
            .map(|s| s.id.clone())
            .collect();
        let column_of: HashMap<&str, usize> = statement_ids
            .iter()
            .enumerate()
            .map(|(j, id)| (id.as_str(), j))
            .collect();

        let participants: Vec<String> = votes
            .iter()
            .filter(|v| column_of.contains_key(v.statement_id.as_str()))
            .map(|v| v.participant_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let row_of: HashMap<&str, usize> = participants
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut rows = vec![vec![0.0; statement_ids.len()]; participants.len()];
        let mut votes_per_statement = vec![0; statement_ids.len()];
        for vote in votes {
            let (Some(&col), Some(&row)) = (
                column_of.get(vote.statement_id.as_str()),
                row_of.get(vote.participant_id.as_str()),
            ) else {
                continue;
            };
            rows[row][col] = vote.value.weight();
            votes_per_statement[col] += 1;
        }

        Self {
            participants,
            statements: statement_ids,
            rows,
            votes_per_statement,
        }
    }

    /// Matrix from raw values, every cell counted as a cast vote.
    pub fn from_rows(
        participants: Vec<String>,
        statements: Vec<String>,
        rows: Vec<Vec<f64>>,
    ) -> Result<Self, ComputeError> {
        if participants.len() != rows.len() {
            return Err(ComputeError::RowCount { participants: participants.len(), rows: rows.len() });
        }
        for (i, row) in rows.iter().enumerate() {
            if row.len() != statements.len() {
                return Err(ComputeError::RaggedMatrix { row: i, expected: statements.len(), found: row.len() });
            }
            if let Some(j) = row.iter().position(|v| !v.is_finite()) {
                return Err(ComputeError::NonFinite { row: i, col: j });
            }
        }
        let votes_per_statement = vec![participants.len(); statements.len()];
        Ok(Self { participants, statements, rows, votes_per_statement })
    }

    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty() || self.statements.is_empty()
    }

    pub fn value(&self, row: usize, col: usize) -> f64 {
        self.rows[row][col]
    }

    pub fn has_votes(&self, col: usize) -> bool {
        self.votes_per_statement[col] > 0
    }

    pub fn participant_index(&self, participant_id: &str) -> Option<usize> {
        self.participants.iter().position(|p| p == participant_id)
    }

    pub fn statement_index(&self, statement_id: &str) -> Option<usize> {
        self.statements.iter().position(|s| s == statement_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteValue;
    use chrono::Utc;

    fn statement(id: &str) -> Statement {
        let mut s = Statement::new("poll".to_string(), id.to_string());
        s.id = id.to_string();
        s
    }

    fn vote(participant: &str, statement: &str, value: VoteValue) -> Vote {
        Vote {
            id: format!("{}-{}", participant, statement),
            participant_id: participant.to_string(),
            statement_id: statement.to_string(),
            value,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            revision: 1,
        }
    }

    #[test]
    fn encodes_votes_with_stable_indices() {
        let statements = vec![statement("s2"), statement("s1")];
        let votes = vec![
            vote("zed", "s1", VoteValue::Agree),
            vote("amy", "s2", VoteValue::Disagree),
            vote("amy", "s1", VoteValue::Pass),
        ];

        let matrix = OpinionMatrix::build(&statements, &votes);

        assert_eq!(matrix.statements(), &["s2".to_string(), "s1".to_string()]);
        assert_eq!(matrix.participants(), &["amy".to_string(), "zed".to_string()]);
        assert_eq!(matrix.rows(), &[vec![-1.0, 0.0], vec![0.0, 1.0]]);
        assert_eq!(matrix.participant_index("zed"), Some(1));
        assert_eq!(matrix.statement_index("s1"), Some(1));
    }

    #[test]
    fn tracks_statements_without_votes() {
        let statements = vec![statement("s1"), statement("quiet")];
        let votes = vec![vote("amy", "s1", VoteValue::Pass)];

        let matrix = OpinionMatrix::build(&statements, &votes);
        assert!(matrix.has_votes(0));
        assert!(!matrix.has_votes(1));
    }

    #[test]
    fn ignores_deleted_and_foreign_statements() {
        let mut gone = statement("gone");
        gone.deleted = true;
        let statements = vec![statement("s1"), gone];
        let votes = vec![
            vote("amy", "s1", VoteValue::Agree),
            vote("bob", "gone", VoteValue::Agree),
            vote("cat", "elsewhere", VoteValue::Agree),
        ];

        let matrix = OpinionMatrix::build(&statements, &votes);
        assert_eq!(matrix.statement_count(), 1);
        assert_eq!(matrix.participants(), &["amy".to_string()]);
    }

    #[test]
    fn no_votes_yields_empty_matrix() {
        let matrix = OpinionMatrix::build(&[statement("s1")], &[]);
        assert!(matrix.is_empty());
        assert_eq!(matrix.participant_count(), 0);
    }

    #[test]
    fn from_rows_validates_shape() {
        let err = OpinionMatrix::from_rows(
            vec!["a".into(), "b".into()],
            vec!["s".into()],
            vec![vec![1.0], vec![1.0, 0.0]],
        )
        .unwrap_err();
        assert!(matches!(err, ComputeError::RaggedMatrix { row: 1, expected: 1, found: 2 }));

        let err = OpinionMatrix::from_rows(vec!["a".into()], vec!["s".into()], vec![vec![f64::NAN]]).unwrap_err();
        assert!(matches!(err, ComputeError::NonFinite { row: 0, col: 0 }));
    }
}
