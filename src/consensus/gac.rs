use std::collections::BTreeMap;

use super::matrix::OpinionMatrix;
use crate::error::ComputeError;

/// Laplace-smoothed agreement: `(1 + agree) / (2 + agree + disagree)`.
pub fn smoothed_agreement(agree: usize, non_zero: usize) -> f64 {
    (1.0 + agree as f64) / (2.0 + non_zero as f64)
}

pub fn is_constitutionable(score: f64, threshold: f64) -> bool {
    score >= threshold
}

/// Group-aware consensus per statement column.
///
/// For every cluster the column's agreement is smoothed independently; the
/// score is the product over clusters, so one dissenting group pulls the
/// whole statement down. Labels are indexed like the matrix rows.
pub fn score(matrix: &OpinionMatrix, labels: &[usize]) -> Result<Vec<f64>, ComputeError> {
    if labels.len() != matrix.participant_count() {
        return Err(ComputeError::LabelMismatch {
            labels: labels.len(),
            rows: matrix.participant_count(),
        });
    }

    // Dense slot per distinct label, in ascending label order.
    let slots: BTreeMap<usize, usize> = labels
        .iter()
        .copied()
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .enumerate()
        .map(|(slot, label)| (label, slot))
        .collect();
    let slot_of_row: Vec<usize> = labels.iter().map(|l| slots[l]).collect();

    let scores: Vec<f64> = (0..matrix.statement_count())
        .map(|col| {
            let mut agree = vec![0usize; slots.len()];
            let mut non_zero = vec![0usize; slots.len()];
            for (row, slot) in slot_of_row.iter().enumerate() {
                let value = matrix.value(row, col);
                if value > 0.0 {
                    agree[*slot] += 1;
                }
                if value != 0.0 {
                    non_zero[*slot] += 1;
                }
            }
            agree
                .iter()
                .zip(&non_zero)
                .map(|(a, n)| smoothed_agreement(*a, *n))
                .product::<f64>()
        })
        .collect();

    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<f64>>) -> OpinionMatrix {
        let participants = (0..rows.len()).map(|i| format!("p{}", i)).collect();
        let statements = (0..rows.first().map_or(0, |r| r.len())).map(|j| format!("s{}", j)).collect();
        OpinionMatrix::from_rows(participants, statements, rows).unwrap()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn smoothing_is_neutral_without_votes() {
        assert!(close(smoothed_agreement(0, 0), 0.5));
        assert!(close(smoothed_agreement(3, 3), 0.8));
        assert!(close(smoothed_agreement(0, 3), 0.2));
    }

    #[test]
    fn single_cluster_is_plain_smoothed_ratio() {
        let m = matrix(vec![vec![1.0], vec![1.0], vec![-1.0], vec![0.0], vec![1.0]]);
        let scores = score(&m, &[0; 5]).unwrap();
        // agree 3, disagree 1, pass ignored
        assert!(close(scores[0], (1.0 + 3.0) / (2.0 + 4.0)));
    }

    #[test]
    fn cross_group_disagreement_is_suppressed() {
        // Faction 0 agrees 10/10, faction 1 agrees 2/10.
        let mut rows = vec![vec![1.0]; 10];
        rows.extend(vec![vec![1.0]; 2]);
        rows.extend(vec![vec![-1.0]; 8]);
        let labels: Vec<usize> = (0..20).map(|i| if i < 10 { 0 } else { 1 }).collect();

        let gac = score(&matrix(rows), &labels).unwrap()[0];
        let expected = (11.0 / 12.0) * (3.0 / 12.0);
        assert!(close(gac, expected));

        let aggregate = smoothed_agreement(12, 20);
        assert!(gac < aggregate / 2.0);
    }

    #[test]
    fn weaker_cluster_agreement_never_raises_score() {
        let labels: Vec<usize> = (0..6).map(|i| i / 3).collect();
        let mut previous = f64::INFINITY;
        // Cluster 1 loses agreement one voter at a time.
        for flipped in 0..=3 {
            let mut rows = vec![vec![1.0]; 6];
            for row in rows.iter_mut().skip(3).take(flipped) {
                row[0] = -1.0;
            }
            let gac = score(&matrix(rows), &labels).unwrap()[0];
            assert!(gac <= previous);
            previous = gac;
        }
    }

    #[test]
    fn scores_stay_in_unit_interval() {
        let rows = vec![
            vec![1.0, -1.0, 0.0],
            vec![1.0, -1.0, 0.0],
            vec![-1.0, 1.0, 0.0],
            vec![-1.0, -1.0, 1.0],
        ];
        for labels in [vec![0, 0, 0, 0], vec![0, 0, 1, 1], vec![0, 1, 2, 3], vec![7, 7, 2, 9]] {
            for s in score(&matrix(rows.clone()), &labels).unwrap() {
                assert!((0.0..=1.0).contains(&s));
            }
        }
    }

    #[test]
    fn label_values_do_not_matter() {
        let rows = vec![vec![1.0], vec![1.0], vec![-1.0], vec![-1.0]];
        let a = score(&matrix(rows.clone()), &[0, 0, 1, 1]).unwrap();
        let b = score(&matrix(rows), &[9, 9, 4, 4]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_wrong_label_count() {
        let m = matrix(vec![vec![1.0], vec![1.0]]);
        assert!(matches!(score(&m, &[0]), Err(ComputeError::LabelMismatch { labels: 1, rows: 2 })));
    }
}
