use crate::cache::ResultCache;
use crate::error::MetricsResult;
use crate::pipeline::{IngestStats, IngestionBuffer};
use crate::store::SampleStore;
use crate::telemetry::{NewNodeSample, NodeSample};
use crate::uptime::{UptimeEngine, UptimeOptions};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Entry point for collectors and the recompute job.
pub struct NodeMetrics {
    store: Arc<dyn SampleStore>,
    buffer: IngestionBuffer,
    engine: UptimeEngine,
    node_ids: Option<Vec<String>>,
    reverse_node_order: bool,
}

impl NodeMetrics {
    pub fn new(
        store: Arc<dyn SampleStore>,
        cache: Arc<dyn ResultCache>,
        options: UptimeOptions,
    ) -> Self {
        Self {
            buffer: IngestionBuffer::new(store.clone()),
            engine: UptimeEngine::new(store.clone(), cache, options),
            store,
            node_ids: None,
            reverse_node_order: false,
        }
    }

    /// Recompute these nodes instead of every node in the store.
    pub fn with_node_ids(mut self, node_ids: Option<Vec<String>>) -> Self {
        self.node_ids = node_ids;
        self
    }

    pub fn with_reverse_node_order(mut self, reverse: bool) -> Self {
        self.reverse_node_order = reverse;
        self
    }

    pub fn engine(&self) -> &UptimeEngine {
        &self.engine
    }

    pub fn ingest(&self, sample: NewNodeSample) {
        self.buffer.enqueue(sample);
    }

    pub fn start_ingestion(&self) -> MetricsResult<()> {
        self.buffer.start()
    }

    pub async fn stop_ingestion(&self) {
        self.buffer.stop().await;
    }

    pub async fn flush_ingestion(&self) -> MetricsResult<()> {
        self.buffer.flush().await
    }

    pub fn pending_samples(&self) -> u64 {
        self.buffer.pending()
    }

    pub fn ingestion_stats(&self) -> Arc<IngestStats> {
        self.buffer.stats()
    }

    pub async fn recompute_uptime(
        &self,
        node_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> MetricsResult<NodeSample> {
        self.engine
            .recompute_uptime(node_id, window_start, window_end)
            .await
    }

    pub async fn recompute_uptime_for_all(
        &self,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MetricsResult<Vec<NodeSample>> {
        let node_ids = self.node_ids().await?;
        tracing::info!(
            nodes = node_ids.len(),
            %window_start,
            %window_end,
            "recomputing uptime"
        );
        self.engine
            .recompute_uptime_for_all(&node_ids, window_start, window_end, cancel)
            .await
    }

    pub async fn get_uptime(&self, node_id: &str) -> MetricsResult<f32> {
        self.engine.stored_uptime(node_id).await
    }

    async fn node_ids(&self) -> MetricsResult<Vec<String>> {
        let mut node_ids = match &self.node_ids {
            Some(node_ids) => node_ids.clone(),
            None => self.store.node_ids().await?,
        };
        if self.reverse_node_order {
            node_ids.reverse();
        }
        Ok(node_ids)
    }
}
