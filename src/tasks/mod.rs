pub mod gac_updater;
pub mod leases;

pub use gac_updater::{run_batch, score_poll, update_gac_scores_task, BatchReport, PollOutcome, ScoringContext};
pub use leases::{PollLease, PollLeases};
