use crate::error::{MetricsError, MetricsResult};
use crate::store::{GapSum, GapSumQuery, SampleStore};
use crate::telemetry::{NewNodeSample, NodeSample, NodeType};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub const NETWORK_HEIGHT: u64 = 1_000;

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

pub fn at(offset_seconds: i64) -> DateTime<Utc> {
    base_time() + ChronoDuration::seconds(offset_seconds)
}

/// A light-node heartbeat that is fully synced with the network.
pub fn heartbeat(node_id: &str) -> NewNodeSample {
    let mut sample = NewNodeSample::new(node_id, NodeType::Light);
    sample.network_height = NETWORK_HEIGHT;
    sample.das_total_sampled_headers = NETWORK_HEIGHT;
    sample.start_time = Some(base_time());
    sample
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<NodeSample>,
    next_id: u64,
    failing_nodes: HashSet<String>,
    fail_inserts: bool,
}

/// In-process [`SampleStore`] mirroring the Postgres queries, with counters
/// and failure injection for tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    gap_sum_calls: AtomicUsize,
    rows_scanned: AtomicUsize,
    inserts: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, sample: NewNodeSample, created_at: DateTime<Utc>) -> NodeSample {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let row = NodeSample::from_new(state.next_id, created_at, sample);
        state.rows.push(row.clone());
        row
    }

    /// Seeds one synced heartbeat per offset.
    pub fn seed_heartbeats(&self, node_id: &str, offsets: impl IntoIterator<Item = i64>) {
        for offset in offsets {
            self.seed(heartbeat(node_id), at(offset));
        }
    }

    pub fn rows(&self, node_id: &str) -> Vec<NodeSample> {
        let state = self.state.lock().unwrap();
        state
            .rows
            .iter()
            .filter(|row| row.node_id == node_id)
            .cloned()
            .collect()
    }

    pub fn fail_node(&self, node_id: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_nodes.insert(node_id.to_string());
    }

    pub fn fail_inserts(&self, fail: bool) {
        self.state.lock().unwrap().fail_inserts = fail;
    }

    /// Every store call sleeps this long first.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn gap_sum_calls(&self) -> usize {
        self.gap_sum_calls.load(Ordering::SeqCst)
    }

    pub fn rows_scanned(&self) -> usize {
        self.rows_scanned.load(Ordering::SeqCst)
    }

    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.gap_sum_calls.store(0, Ordering::SeqCst);
        self.rows_scanned.store(0, Ordering::SeqCst);
    }

    async fn pause(&self) {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_node(state: &MemoryState, node_id: &str) -> MetricsResult<()> {
        if state.failing_nodes.contains(node_id) {
            return Err(MetricsError::from(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn insert(&self, sample: &NewNodeSample) -> MetricsResult<NodeSample> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        if state.fail_inserts {
            return Err(MetricsError::from(sqlx::Error::PoolTimedOut));
        }
        let created_at = state
            .rows
            .last()
            .map(|row| row.created_at + ChronoDuration::seconds(1))
            .unwrap_or_else(base_time);
        state.next_id += 1;
        let row = NodeSample::from_new(state.next_id, created_at, sample.clone());
        state.rows.push(row.clone());
        self.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(row)
    }

    async fn latest_sample(&self, node_id: &str) -> MetricsResult<Option<NodeSample>> {
        self.pause().await;
        let state = self.state.lock().unwrap();
        Self::check_node(&state, node_id)?;
        Ok(state
            .rows
            .iter()
            .rev()
            .find(|row| row.node_id == node_id)
            .cloned())
    }

    async fn sample_at_or_after(
        &self,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> MetricsResult<Option<NodeSample>> {
        self.pause().await;
        let state = self.state.lock().unwrap();
        Self::check_node(&state, node_id)?;
        Ok(state
            .rows
            .iter()
            .find(|row| row.node_id == node_id && row.created_at >= at)
            .cloned())
    }

    async fn network_height_before(&self, before: DateTime<Utc>) -> MetricsResult<u64> {
        self.pause().await;
        let state = self.state.lock().unwrap();
        Ok(state
            .rows
            .iter()
            .filter(|row| row.created_at < before)
            .map(|row| row.network_height)
            .max()
            .unwrap_or(0))
    }

    async fn gap_sum(&self, query: &GapSumQuery) -> MetricsResult<GapSum> {
        self.pause().await;
        self.gap_sum_calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Self::check_node(&state, &query.node_id)?;

        let node_rows: Vec<&NodeSample> = state
            .rows
            .iter()
            .filter(|row| row.node_id == query.node_id)
            .collect();
        let mut scanned: Vec<&NodeSample> = node_rows
            .iter()
            .copied()
            .filter(|row| row.sequence_id > query.after_id)
            .collect();
        let closing = scanned
            .iter()
            .position(|row| row.created_at >= query.end_time);
        if let Some(closing) = closing {
            scanned.truncate(closing + 1);
        }
        self.rows_scanned.fetch_add(scanned.len(), Ordering::SeqCst);

        let mut processed_through_id = query.after_id;
        let mut gap_seconds = 0u64;
        for pair in scanned.windows(2) {
            let (row, next) = (pair[0], pair[1]);
            if row.created_at >= query.end_time || row.network_height <= query.height_floor {
                continue;
            }
            processed_through_id = processed_through_id.max(row.sequence_id);
            let gap = next.created_at.timestamp() - row.created_at.timestamp();
            if gap < query.gap_threshold_seconds as i64 {
                gap_seconds += gap.max(0) as u64;
            }
        }

        let observed_through_id = node_rows
            .iter()
            .map(|row| row.sequence_id)
            .max()
            .unwrap_or(query.after_id);
        Ok(GapSum {
            processed_through_id,
            gap_seconds,
            observed_through_id,
            closed: closing.is_some(),
        })
    }

    async fn store_uptime(
        &self,
        node_id: &str,
        runtime_seconds: u64,
        uptime_score: f32,
    ) -> MetricsResult<Option<NodeSample>> {
        self.pause().await;
        let mut state = self.state.lock().unwrap();
        Self::check_node(&state, node_id)?;
        let Some(row) = state.rows.iter_mut().rev().find(|row| row.node_id == node_id) else {
            return Ok(None);
        };
        row.accumulated_runtime_seconds = runtime_seconds;
        row.recomputed_uptime_score = Some(uptime_score);
        Ok(Some(row.clone()))
    }

    async fn node_ids(&self) -> MetricsResult<Vec<String>> {
        self.pause().await;
        let state = self.state.lock().unwrap();
        let ids: BTreeSet<String> = state.rows.iter().map(|row| row.node_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }
}
