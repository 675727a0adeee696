pub mod changes;
pub mod gac;
pub mod kmeans;
pub mod matrix;
pub mod pca;

use log::debug;

use crate::error::ComputeError;
use matrix::OpinionMatrix;

/// Output of the opinion space reducer.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// One row of coordinates per participant, at least two components each.
    Projected {
        coordinates: Vec<Vec<f64>>,
        explained_variance_ratio: Vec<f64>,
    },
    /// Too little data to project; every participant belongs to one group.
    SingleGroup,
}

/// Projects the opinion matrix into a low-dimensional space.
pub trait OpinionReducer: Send + Sync {
    fn reduce(&self, matrix: &OpinionMatrix) -> Result<Reduction, ComputeError>;
}

/// Assigns a cluster label to every projected participant.
pub trait GroupDetector: Send + Sync {
    fn cluster(&self, coordinates: &[Vec<f64>]) -> Result<Vec<usize>, ComputeError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusResult {
    /// GAC score per matrix column.
    pub scores: Vec<f64>,
    /// Cluster label per matrix row.
    pub labels: Vec<usize>,
    pub group_count: usize,
    pub components: usize,
}

/// Runs reduce -> cluster -> score. Returns `None` for an empty matrix.
pub fn compute(
    matrix: &OpinionMatrix,
    reducer: &dyn OpinionReducer,
    detector: &dyn GroupDetector,
) -> Result<Option<ConsensusResult>, ComputeError> {
    if matrix.is_empty() {
        return Ok(None);
    }

    let (labels, components) = match reducer.reduce(matrix)? {
        Reduction::SingleGroup => (vec![0; matrix.participant_count()], 0),
        Reduction::Projected { coordinates, .. } => {
            let components = coordinates.first().map_or(0, |c| c.len());
            (detector.cluster(&coordinates)?, components)
        }
    };

    let group_count = labels.iter().collect::<std::collections::HashSet<_>>().len();
    let scores = gac::score(matrix, &labels)?;
    debug!(
        "Scored {} statements for {} participants in {} group(s)",
        scores.len(),
        matrix.participant_count(),
        group_count
    );

    Ok(Some(ConsensusResult {
        scores,
        labels,
        group_count,
        components,
    }))
}
