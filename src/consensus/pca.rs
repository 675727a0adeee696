use log::debug;

use super::matrix::OpinionMatrix;
use super::{OpinionReducer, Reduction};
use crate::error::ComputeError;

/// Never project to fewer axes than this.
pub const MIN_COMPONENTS: usize = 2;
/// A component explaining less variance than this ends the selection.
pub const MIN_EXPLAINED_VARIANCE: f64 = 0.01;

const MAX_SWEEPS: usize = 64;
const OFF_DIAGONAL_TOLERANCE: f64 = 1e-18;

/// Principal component analysis over the centered opinion matrix.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pca;

impl OpinionReducer for Pca {
    fn reduce(&self, matrix: &OpinionMatrix) -> Result<Reduction, ComputeError> {
        let n = matrix.participant_count();
        let p = matrix.statement_count();
        if n == 0 || p == 0 {
            return Ok(Reduction::SingleGroup);
        }

        let centered = center_columns(matrix.rows());

        // Eigen-decompose whichever of the covariance (p x p) or Gram (n x n)
        // matrix is smaller; both share their non-zero spectrum.
        let (eigenvalues, coordinates) = if p <= n {
            let (values, vectors) = symmetric_eigen(covariance(&centered, p));
            let coords = centered
                .iter()
                .map(|row| {
                    (0..values.len())
                        .map(|c| row.iter().zip(&vectors).map(|(x, v)| x * v[c]).sum::<f64>())
                        .collect()
                })
                .collect::<Vec<Vec<f64>>>();
            (values, coords)
        } else {
            let (values, vectors) = symmetric_eigen(gram(&centered));
            let scale: Vec<f64> = values.iter().map(|v| v.max(0.0).sqrt()).collect();
            let coords = vectors
                .iter()
                .map(|u| u.iter().zip(&scale).map(|(x, s)| x * s).collect())
                .collect::<Vec<Vec<f64>>>();
            (values, coords)
        };

        let ratios = explained_variance_ratio(&eigenvalues);
        let requested = select_component_count(&ratios);
        let components = clamp_component_count(requested, n, p);
        debug!(
            "PCA on {}x{} matrix: variance ratios {:?}, {} components (requested {})",
            n, p, ratios, components, requested
        );

        if components < MIN_COMPONENTS {
            return Ok(Reduction::SingleGroup);
        }

        let coordinates = coordinates
            .into_iter()
            .map(|mut row| {
                row.truncate(components);
                row
            })
            .collect();

        Ok(Reduction::Projected {
            coordinates,
            explained_variance_ratio: ratios.into_iter().take(components).collect(),
        })
    }
}

/// Smallest count whose next component explains under 1%, floored at two.
pub fn select_component_count(ratios: &[f64]) -> usize {
    ratios
        .iter()
        .position(|r| *r < MIN_EXPLAINED_VARIANCE)
        .unwrap_or(ratios.len())
        .max(MIN_COMPONENTS)
}

pub fn clamp_component_count(requested: usize, participants: usize, statements: usize) -> usize {
    requested
        .min(participants.saturating_sub(1))
        .min(statements)
}

fn explained_variance_ratio(eigenvalues: &[f64]) -> Vec<f64> {
    let clipped: Vec<f64> = eigenvalues.iter().map(|v| v.max(0.0)).collect();
    let total: f64 = clipped.iter().sum();
    if total <= f64::EPSILON {
        return vec![0.0; clipped.len()];
    }
    clipped.iter().map(|v| v / total).collect()
}

fn center_columns(rows: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = rows.len() as f64;
    let p = rows.first().map_or(0, |r| r.len());
    let means: Vec<f64> = (0..p)
        .map(|j| rows.iter().map(|r| r[j]).sum::<f64>() / n)
        .collect();
    rows.iter()
        .map(|r| r.iter().zip(&means).map(|(x, m)| x - m).collect())
        .collect()
}

/// X^T X, unnormalized; variance ratios are scale free.
fn covariance(centered: &[Vec<f64>], p: usize) -> Vec<Vec<f64>> {
    let mut cov = vec![vec![0.0; p]; p];
    for row in centered {
        for a in 0..p {
            if row[a] == 0.0 {
                continue;
            }
            for b in a..p {
                cov[a][b] += row[a] * row[b];
            }
        }
    }
    for a in 0..p {
        for b in 0..a {
            cov[a][b] = cov[b][a];
        }
    }
    cov
}

fn gram(centered: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = centered.len();
    let mut g = vec![vec![0.0; n]; n];
    for i in 0..n {
        for k in i..n {
            let dot: f64 = centered[i].iter().zip(&centered[k]).map(|(a, b)| a * b).sum();
            g[i][k] = dot;
            g[k][i] = dot;
        }
    }
    g
}

/// Cyclic Jacobi eigen-decomposition of a symmetric matrix.
///
/// Returns eigenvalues in descending order and the matching eigenvectors as
/// columns: `vectors[k][c]` is component `k` of eigenvector `c`.
fn symmetric_eigen(mut a: Vec<Vec<f64>>) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = a.len();
    let mut v = vec![vec![0.0; n]; n];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }

    for _ in 0..MAX_SWEEPS {
        let off: f64 = (0..n)
            .flat_map(|p| ((p + 1)..n).map(move |q| (p, q)))
            .map(|(p, q)| a[p][q] * a[p][q])
            .sum();
        if off < OFF_DIAGONAL_TOLERANCE {
            break;
        }

        for p in 0..n {
            for q in (p + 1)..n {
                let apq = a[p][q];
                if apq.abs() < f64::MIN_POSITIVE {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * apq);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for row in v.iter_mut() {
                    let vkp = row[p];
                    let vkq = row[q];
                    row[p] = c * vkp - s * vkq;
                    row[q] = s * vkp + c * vkq;
                }
            }
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&x, &y| a[y][y].partial_cmp(&a[x][x]).unwrap_or(std::cmp::Ordering::Equal));

    let values = order.iter().map(|&i| a[i][i]).collect();
    let vectors = v
        .iter()
        .map(|row| order.iter().map(|&i| row[i]).collect())
        .collect();
    (values, vectors)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(rows: Vec<Vec<f64>>) -> OpinionMatrix {
        let participants = (0..rows.len()).map(|i| format!("p{}", i)).collect();
        let statements = (0..rows.first().map_or(0, |r| r.len())).map(|j| format!("s{}", j)).collect();
        OpinionMatrix::from_rows(participants, statements, rows).unwrap()
    }

    #[test]
    fn component_selection_stops_before_negligible_axis() {
        assert_eq!(select_component_count(&[0.6, 0.3, 0.095, 0.005]), 3);
        assert_eq!(select_component_count(&[0.5, 0.3, 0.2]), 3);
    }

    #[test]
    fn component_selection_never_goes_below_two() {
        assert_eq!(select_component_count(&[0.995, 0.005]), 2);
        assert_eq!(select_component_count(&[0.0, 0.0, 0.0]), 2);
        assert_eq!(select_component_count(&[]), 2);
    }

    #[test]
    fn clamp_respects_participants_and_statements() {
        assert_eq!(clamp_component_count(4, 3, 10), 2);
        assert_eq!(clamp_component_count(4, 50, 3), 3);
        assert_eq!(clamp_component_count(2, 1, 5), 0);
    }

    #[test]
    fn eigen_decomposition_of_known_matrix() {
        let (values, vectors) = symmetric_eigen(vec![vec![2.0, 1.0], vec![1.0, 2.0]]);
        assert!((values[0] - 3.0).abs() < 1e-9);
        assert!((values[1] - 1.0).abs() < 1e-9);
        // Leading eigenvector is (1, 1) / sqrt(2), up to sign.
        assert!((vectors[0][0].abs() - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-9);
        assert!((vectors[0][0] - vectors[1][0]).abs() < 1e-9);
    }

    #[test]
    fn too_few_participants_collapses_to_single_group() {
        let reduction = Pca.reduce(&matrix(vec![vec![1.0, -1.0, 0.0], vec![-1.0, 1.0, 1.0]])).unwrap();
        assert_eq!(reduction, Reduction::SingleGroup);
    }

    #[test]
    fn single_statement_collapses_to_single_group() {
        let rows = (0..30).map(|i| vec![if i % 2 == 0 { 1.0 } else { -1.0 }]).collect();
        assert_eq!(Pca.reduce(&matrix(rows)).unwrap(), Reduction::SingleGroup);
    }

    #[test]
    fn projects_two_factions_apart() {
        let mut rows = Vec::new();
        for _ in 0..6 {
            rows.push(vec![1.0, 1.0, -1.0, 0.0]);
        }
        for _ in 0..6 {
            rows.push(vec![-1.0, -1.0, 1.0, 0.0]);
        }

        let Reduction::Projected { coordinates, explained_variance_ratio } = Pca.reduce(&matrix(rows)).unwrap() else {
            panic!("expected a projection");
        };
        assert_eq!(coordinates.len(), 12);
        assert_eq!(coordinates[0].len(), 2);
        assert!(explained_variance_ratio[0] > 0.99);
        // The first axis separates the factions by sign.
        assert!(coordinates[0][0] * coordinates[11][0] < 0.0);
        assert!((coordinates[0][0] - coordinates[5][0]).abs() < 1e-9);
    }

    #[test]
    fn wide_matrix_uses_gram_path() {
        // More statements than participants.
        let rows = vec![
            vec![1.0, 1.0, 1.0, -1.0, 0.0, 1.0],
            vec![1.0, 1.0, 0.0, -1.0, 1.0, 1.0],
            vec![-1.0, -1.0, -1.0, 1.0, 0.0, -1.0],
            vec![-1.0, 0.0, -1.0, 1.0, -1.0, -1.0],
        ];
        let Reduction::Projected { coordinates, .. } = Pca.reduce(&matrix(rows)).unwrap() else {
            panic!("expected a projection");
        };
        assert_eq!(coordinates.len(), 4);
        assert!(coordinates.iter().all(|c| c.len() >= 2 && c.len() <= 3));
        assert!(coordinates[0][0] * coordinates[2][0] < 0.0);
    }
}
