use crate::cache::CacheKey;
use crate::store::{GapSum, GapSumQuery};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

const KEY_DOMAIN: &[u8] = b"nodelog/gap-sum/v1";

/// How far the runtime aggregation for one `(node, end_time)` boundary has
/// progressed. Every field takes part in the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub node_id: String,
    pub height_floor: u64,
    pub end_time: DateTime<Utc>,
    pub gap_threshold_seconds: u64,
    pub processed_through_id: u64,
    pub cumulative_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Advance {
    Moved(Checkpoint),
    Stalled,
    /// The result points behind this checkpoint or claims seconds without
    /// progress; never produced by a healthy store.
    Inconsistent,
}

impl Checkpoint {
    pub fn origin(
        node_id: impl Into<String>,
        height_floor: u64,
        end_time: DateTime<Utc>,
        gap_threshold_seconds: u64,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            height_floor,
            end_time,
            gap_threshold_seconds,
            processed_through_id: 0,
            cumulative_seconds: 0,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        let mut hasher = Sha256::new();
        hasher.update(KEY_DOMAIN);
        hasher.update((self.node_id.len() as u64).to_be_bytes());
        hasher.update(self.node_id.as_bytes());
        hasher.update(self.height_floor.to_be_bytes());
        hasher.update(self.end_time.timestamp().to_be_bytes());
        hasher.update(self.end_time.timestamp_subsec_nanos().to_be_bytes());
        hasher.update(self.gap_threshold_seconds.to_be_bytes());
        hasher.update(self.processed_through_id.to_be_bytes());
        hasher.update(self.cumulative_seconds.to_be_bytes());
        CacheKey::from_digest(&hasher.finalize())
    }

    pub fn query(&self) -> GapSumQuery {
        GapSumQuery {
            node_id: self.node_id.clone(),
            after_id: self.processed_through_id,
            end_time: self.end_time,
            height_floor: self.height_floor,
            gap_threshold_seconds: self.gap_threshold_seconds,
        }
    }

    pub(crate) fn advance(&self, result: &GapSum) -> Advance {
        if result.processed_through_id > self.processed_through_id {
            let mut next = self.clone();
            next.processed_through_id = result.processed_through_id;
            next.cumulative_seconds = self.cumulative_seconds.saturating_add(result.gap_seconds);
            Advance::Moved(next)
        } else if result.processed_through_id == self.processed_through_id
            && result.gap_seconds == 0
        {
            Advance::Stalled
        } else {
            Advance::Inconsistent
        }
    }
}
