use std::collections::BTreeSet;

use crate::db::ScoreStore;
use crate::error::StoreError;

/// Polls with vote activity newer than their statements' last score.
pub async fn polls_needing_recompute(store: &dyn ScoreStore) -> Result<BTreeSet<String>, StoreError> {
    Ok(store.polls_with_unscored_activity().await?.into_iter().collect())
}
