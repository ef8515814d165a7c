//! Persistence for aggregate sync counters.
//!
//! Stats live as a small JSON record under a fixed key in the key/value
//! table. An unreadable record is treated as absent so a corrupted blob can
//! never stop the engine from starting.

use tracing::warn;

use crate::database::Database;
use crate::error::MedSyncResult;
use crate::models::SyncStats;

/// Fixed storage key for the persisted stats record
pub const STATS_KEY: &str = "sync_stats";

/// Load persisted stats, resetting to zero when missing or corrupt
pub fn load_stats(db: &Database) -> MedSyncResult<SyncStats> {
    let Some(raw) = db.get_meta(STATS_KEY)? else {
        return Ok(SyncStats::default());
    };

    match serde_json::from_str::<SyncStats>(&raw) {
        Ok(stats) => Ok(stats),
        Err(e) => {
            warn!(error = %e, "Persisted sync stats are unreadable, resetting to zero");
            Ok(SyncStats::default())
        }
    }
}

/// Persist stats under [`STATS_KEY`]
pub fn save_stats(db: &Database, stats: &SyncStats) -> MedSyncResult<()> {
    let json = serde_json::to_string(stats)?;
    db.put_meta(STATS_KEY, &json)
}
