//! Uptime recomputation.
//!
//! Runtime is the sum of heartbeat gaps shorter than the configured threshold.
//! The sum is split into segments bounded by a [`Checkpoint`]; each segment
//! result is cached under the checkpoint that started it, so a recompute only
//! queries rows written since the previous one.

mod checkpoint;
mod score;


pub use checkpoint::Checkpoint;
pub use score::uptime_score;

use crate::cache::{cached_query, read_cached, store_cached, ResultCache};
use crate::error::{MetricsError, MetricsResult};
use crate::store::{GapSum, SampleStore};
use crate::telemetry::NodeSample;
use checkpoint::Advance;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_GAP_THRESHOLD_SECONDS: u64 = 100;
pub const DEFAULT_RECOMPUTE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq)]
pub struct UptimeOptions {
    pub gap_threshold_seconds: u64,
    /// Rows at or below this network height are not counted as runtime.
    pub height_floor: u64,
    pub recompute_timeout: Duration,
    /// Write the recomputed runtime and score back onto the latest row.
    pub persist: bool,
}

impl Default for UptimeOptions {
    fn default() -> Self {
        Self {
            gap_threshold_seconds: DEFAULT_GAP_THRESHOLD_SECONDS,
            height_floor: 0,
            recompute_timeout: DEFAULT_RECOMPUTE_TIMEOUT,
            persist: true,
        }
    }
}

/// Result of walking the cached segments for one node and end time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeTotal {
    pub seconds: u64,
    pub processed_through_id: u64,
    /// Segments answered from the cache.
    pub cached_segments: usize,
    /// Whether the store was queried.
    pub queried: bool,
}

enum Frontier {
    Miss,
    /// A converged entry that predates rows written since.
    Stale,
}

#[derive(Clone)]
pub struct UptimeEngine {
    store: Arc<dyn SampleStore>,
    cache: Arc<dyn ResultCache>,
    options: UptimeOptions,
}

impl UptimeEngine {
    pub fn new(
        store: Arc<dyn SampleStore>,
        cache: Arc<dyn ResultCache>,
        options: UptimeOptions,
    ) -> Self {
        Self {
            store,
            cache,
            options,
        }
    }

    pub fn options(&self) -> &UptimeOptions {
        &self.options
    }

    /// Total counted runtime of `node_id` for rows created before `end_time`.
    ///
    /// `high_water` is the sequence id of the node's latest row. A cached walk
    /// that has already observed it, or that reached a row at or after
    /// `end_time`, is returned without touching the store. `end_time` must be
    /// stable across calls for the cache to help.
    pub async fn recompute_runtime(
        &self,
        node_id: &str,
        end_time: DateTime<Utc>,
        high_water: u64,
    ) -> MetricsResult<RuntimeTotal> {
        let cache = self.cache.as_ref();
        let mut checkpoint = Checkpoint::origin(
            node_id,
            self.options.height_floor,
            end_time,
            self.options.gap_threshold_seconds,
        );
        let mut cached_segments = 0usize;

        let frontier = loop {
            let key = checkpoint.cache_key();
            if !cache.exists(&key) {
                break Frontier::Miss;
            }
            let Some(cached) = read_cached::<GapSum>(cache, &key) else {
                break Frontier::Miss;
            };
            match checkpoint.advance(&cached) {
                Advance::Moved(next) => {
                    cached_segments += 1;
                    checkpoint = next;
                }
                Advance::Stalled if cached.closed || cached.observed_through_id >= high_water => {
                    debug!(
                        node = %node_id,
                        cached_segments,
                        runtime_seconds = checkpoint.cumulative_seconds,
                        "runtime served from cache"
                    );
                    return Ok(RuntimeTotal {
                        seconds: checkpoint.cumulative_seconds,
                        processed_through_id: checkpoint.processed_through_id,
                        cached_segments,
                        queried: false,
                    });
                }
                Advance::Stalled => break Frontier::Stale,
                Advance::Inconsistent => {
                    warn!(
                        node = %node_id,
                        key = %key,
                        processed_through_id = checkpoint.processed_through_id,
                        cached_through_id = cached.processed_through_id,
                        "inconsistent cached segment; recomputing it"
                    );
                    break Frontier::Stale;
                }
            }
        };

        let key = checkpoint.cache_key();
        let query = checkpoint.query();
        let segment = match frontier {
            Frontier::Miss => cached_query(cache, &key, || self.store.gap_sum(&query)).await?,
            Frontier::Stale => {
                let segment = self.store.gap_sum(&query).await?;
                store_cached(cache, &key, &segment);
                segment
            }
        };

        match checkpoint.advance(&segment) {
            Advance::Moved(next) => {
                // Lets the next walk stop here without a query when no rows arrive.
                store_cached(
                    cache,
                    &next.cache_key(),
                    &GapSum::empty(
                        next.processed_through_id,
                        segment.observed_through_id,
                        segment.closed,
                    ),
                );
                checkpoint = next;
            }
            Advance::Stalled => {}
            Advance::Inconsistent => {
                warn!(
                    node = %node_id,
                    processed_through_id = checkpoint.processed_through_id,
                    returned_through_id = segment.processed_through_id,
                    "store returned a segment behind the checkpoint; ignoring it"
                );
            }
        }

        Ok(RuntimeTotal {
            seconds: checkpoint.cumulative_seconds,
            processed_through_id: checkpoint.processed_through_id,
            cached_segments,
            queried: true,
        })
    }

    /// Recomputes runtime and uptime score of `node_id` over
    /// `[window_start, window_end)` and returns the reference snapshot, the
    /// node's first row at or after `window_end`, with both fields filled in.
    pub async fn recompute_uptime(
        &self,
        node_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> MetricsResult<NodeSample> {
        let after = self.options.recompute_timeout;
        match tokio::time::timeout(
            after,
            self.recompute_uptime_inner(node_id, window_start, window_end),
        )
        .await
        {
            Ok(result) => result.map_err(|err| err.for_node(node_id)),
            Err(_) => Err(MetricsError::Timeout {
                node_id: node_id.to_string(),
                after,
            }),
        }
    }

    async fn recompute_uptime_inner(
        &self,
        node_id: &str,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> MetricsResult<NodeSample> {
        let started = Instant::now();
        let latest = self
            .store
            .latest_sample(node_id)
            .await?
            .ok_or_else(|| MetricsError::not_found(node_id))?;
        let mut snapshot = self
            .store
            .sample_at_or_after(node_id, window_end)
            .await?
            .ok_or_else(|| MetricsError::not_found(node_id))?;
        let network_height = self.store.network_height_before(window_end).await?;

        let runtime = self
            .recompute_runtime(node_id, window_end, latest.sequence_id)
            .await?;
        let score = uptime_score(
            &snapshot,
            runtime.seconds,
            network_height,
            window_start,
            window_end,
        );

        if self.options.persist {
            self.store
                .store_uptime(node_id, runtime.seconds, score)
                .await?;
        }

        info!(
            node = %node_id,
            old_uptime = snapshot.current_uptime(),
            new_uptime = score,
            runtime_seconds = runtime.seconds,
            network_height,
            cached_segments = runtime.cached_segments,
            queried = runtime.queried,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "uptime recomputed"
        );

        snapshot.accumulated_runtime_seconds = runtime.seconds;
        snapshot.recomputed_uptime_score = Some(score);
        Ok(snapshot)
    }

    /// Recomputes every node in order and stops at the first failure.
    pub async fn recompute_uptime_for_all(
        &self,
        node_ids: &[String],
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> MetricsResult<Vec<NodeSample>> {
        let started = Instant::now();
        let mut recomputed = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            if cancel.is_cancelled() {
                warn!(
                    completed = recomputed.len(),
                    remaining = node_ids.len() - recomputed.len(),
                    "uptime batch cancelled"
                );
                return Err(MetricsError::Cancelled);
            }
            let sample = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(MetricsError::Cancelled),
                result = self.recompute_uptime(node_id, window_start, window_end) => result?,
            };
            recomputed.push(sample);
        }
        info!(
            nodes = recomputed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "uptime batch finished"
        );
        Ok(recomputed)
    }

    /// Last stored score of `node_id`.
    pub async fn stored_uptime(&self, node_id: &str) -> MetricsResult<f32> {
        self.store
            .latest_sample(node_id)
            .await
            .map_err(|err| err.for_node(node_id))?
            .map(|sample| sample.current_uptime())
            .ok_or_else(|| MetricsError::not_found(node_id))
    }
}
