mod postgres;

pub use postgres::{build_pool, PgSampleStore};

use crate::error::MetricsResult;
use crate::telemetry::{NewNodeSample, NodeSample};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bound parameters of one gap-sum segment for a node.
#[derive(Debug, Clone, PartialEq)]
pub struct GapSumQuery {
    pub node_id: String,
    /// Only rows with a strictly greater sequence id are scanned.
    pub after_id: u64,
    pub end_time: DateTime<Utc>,
    pub height_floor: u64,
    pub gap_threshold_seconds: u64,
}

/// Outcome of a gap-sum segment, as stored in the result cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapSum {
    /// Highest sequence id whose heartbeat gap is resolved and inside the
    /// bound; equals `after_id` when the segment resolved nothing.
    pub processed_through_id: u64,
    /// Counted seconds within this segment only.
    pub gap_seconds: u64,
    /// Highest sequence id of the node visible to the query.
    pub observed_through_id: u64,
    /// A row created at or after `end_time` follows `processed_through_id`,
    /// so later rows cannot change this segment.
    #[serde(default)]
    pub closed: bool,
}

impl GapSum {
    pub fn empty(after_id: u64, observed_through_id: u64, closed: bool) -> Self {
        Self {
            processed_through_id: after_id,
            gap_seconds: 0,
            observed_through_id,
            closed,
        }
    }
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    /// Appends a row; the store assigns `sequence_id` and `created_at`.
    async fn insert(&self, sample: &NewNodeSample) -> MetricsResult<NodeSample>;

    async fn latest_sample(&self, node_id: &str) -> MetricsResult<Option<NodeSample>>;

    /// First row of the node created at or after `at`.
    async fn sample_at_or_after(
        &self,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> MetricsResult<Option<NodeSample>>;

    /// Highest reference-chain height reported by any node before `before`.
    async fn network_height_before(&self, before: DateTime<Utc>) -> MetricsResult<u64>;

    async fn gap_sum(&self, query: &GapSumQuery) -> MetricsResult<GapSum>;

    /// Writes the engine-owned fields onto the node's latest row.
    async fn store_uptime(
        &self,
        node_id: &str,
        runtime_seconds: u64,
        uptime_score: f32,
    ) -> MetricsResult<Option<NodeSample>>;

    async fn node_ids(&self) -> MetricsResult<Vec<String>>;
}
