use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Bridge,
    Full,
    Light,
}

impl NodeType {
    pub fn as_db(self) -> i16 {
        match self {
            NodeType::Bridge => 1,
            NodeType::Full => 2,
            NodeType::Light => 3,
        }
    }

    pub fn from_db(value: i16) -> Option<Self> {
        match value {
            1 => Some(NodeType::Bridge),
            2 => Some(NodeType::Full),
            3 => Some(NodeType::Light),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Bridge => "bridge",
            NodeType::Full => "full",
            NodeType::Light => "light",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A snapshot as handed over by the collector, before the store assigns
/// `sequence_id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewNodeSample {
    pub node_id: String,
    pub node_type: NodeType,
    pub network_height: u64,
    pub head: u64,
    pub das_total_sampled_headers: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub accumulated_runtime_seconds: u64,
    pub uptime_score: f32,
}

impl NewNodeSample {
    pub fn new(node_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            node_id: node_id.into(),
            node_type,
            network_height: 0,
            head: 0,
            das_total_sampled_headers: 0,
            start_time: None,
            accumulated_runtime_seconds: 0,
            uptime_score: 0.0,
        }
    }
}

/// One persisted telemetry row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSample {
    pub sequence_id: u64,
    pub created_at: DateTime<Utc>,
    pub node_id: String,
    pub node_type: NodeType,
    pub network_height: u64,
    pub head: u64,
    pub das_total_sampled_headers: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub accumulated_runtime_seconds: u64,
    pub uptime_score: f32,
    pub recomputed_uptime_score: Option<f32>,
}

impl NodeSample {
    pub fn from_new(
        sequence_id: u64,
        created_at: DateTime<Utc>,
        sample: NewNodeSample,
    ) -> Self {
        Self {
            sequence_id,
            created_at,
            node_id: sample.node_id,
            node_type: sample.node_type,
            network_height: sample.network_height,
            head: sample.head,
            das_total_sampled_headers: sample.das_total_sampled_headers,
            start_time: sample.start_time,
            accumulated_runtime_seconds: sample.accumulated_runtime_seconds,
            uptime_score: sample.uptime_score,
            recomputed_uptime_score: None,
        }
    }

    /// Blocks (bridge) or sampled headers (full, light) the node has processed.
    pub fn synced_units(&self) -> u64 {
        match self.node_type {
            NodeType::Bridge => self.head,
            NodeType::Full | NodeType::Light => self.das_total_sampled_headers,
        }
    }

    /// Start time, or `None` when the collector never reported one. Epoch and
    /// earlier count as unreported.
    pub fn known_start_time(&self) -> Option<DateTime<Utc>> {
        self.start_time.filter(|ts| ts.timestamp() > 0)
    }

    /// Score most recently stored for this row.
    pub fn current_uptime(&self) -> f32 {
        self.recomputed_uptime_score.unwrap_or(self.uptime_score)
    }
}

pub(crate) fn to_db_u64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

pub(crate) fn from_db_i64(value: i64) -> u64 {
    value.max(0) as u64
}
