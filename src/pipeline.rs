use crate::error::{MetricsError, MetricsResult};
use crate::store::SampleStore;
use crate::telemetry::NewNodeSample;
use chrono::Utc;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub enum IngestCommand {
    Sample(NewNodeSample),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug)]
pub struct IngestStats {
    pub queue_depth: AtomicU64,
    pub persisted_total: AtomicU64,
    pub dropped_total: AtomicU64,
    pub last_insert_unix_ms: AtomicU64,
    pub average_insert_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            queue_depth: AtomicU64::new(0),
            persisted_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            last_insert_unix_ms: AtomicU64::new(0),
            average_insert_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }

    fn record_insert(&self, micros: u64) {
        self.persisted_total.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis() as u64;
        self.last_insert_unix_ms.store(now, Ordering::Relaxed);
        let prev = self.average_insert_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_insert_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Unbounded FIFO between collectors and the sample store.
///
/// `enqueue` never waits on the store. A single worker drains the queue in
/// order once started; stopping is lossy and discards whatever is still
/// queued.
pub struct IngestionBuffer {
    tx: mpsc::UnboundedSender<IngestCommand>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<IngestCommand>>>,
    store: Arc<dyn SampleStore>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IngestionBuffer {
    pub fn new(store: Arc<dyn SampleStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            store,
            stats: Arc::new(IngestStats::new()),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Samples accepted but not yet written or dropped.
    pub fn pending(&self) -> u64 {
        self.stats.queue_depth.load(Ordering::Relaxed)
    }

    pub fn enqueue(&self, sample: NewNodeSample) {
        if self.cancel.is_cancelled() {
            self.stats.dropped_total.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(node = %sample.node_id, "ingestion stopped; dropping sample");
            return;
        }
        let queue_depth = self.stats.queue_depth.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(queue_depth, node = %sample.node_id, "queued sample");
        if let Err(err) = self.tx.send(IngestCommand::Sample(sample)) {
            self.stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.stats.dropped_total.fetch_add(1, Ordering::Relaxed);
            if let IngestCommand::Sample(sample) = err.0 {
                tracing::warn!(node = %sample.node_id, "ingestion worker gone; dropping sample");
            }
        }
    }

    /// Spawns the worker. Starting twice is a no-op; starting after `stop`
    /// fails.
    pub fn start(&self) -> MetricsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MetricsError::AlreadyStopped);
        }
        let Some(rx) = self.rx.lock().ok().and_then(|mut guard| guard.take()) else {
            tracing::warn!("ingestion worker already running");
            return Ok(());
        };
        let handle = spawn_worker(
            self.store.clone(),
            rx,
            self.stats.clone(),
            self.cancel.clone(),
        );
        if let Ok(mut guard) = self.worker.lock() {
            *guard = Some(handle);
        }
        tracing::info!("ingestion worker started");
        Ok(())
    }

    /// Stops the worker after its in-flight insert and discards the rest of
    /// the queue.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "ingestion worker ended abnormally");
            }
            return;
        }
        // Never started: the receiver is still here.
        let rx = self.rx.lock().ok().and_then(|mut guard| guard.take());
        if let Some(mut rx) = rx {
            discard_queued(&mut rx, &self.stats);
        }
    }

    /// Waits until everything enqueued before this call has been written or
    /// dropped. Before `start` this waits for the worker to come up.
    pub async fn flush(&self) -> MetricsResult<()> {
        if self.cancel.is_cancelled() {
            return Err(MetricsError::AlreadyStopped);
        }
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(IngestCommand::Flush(done_tx)).is_err() {
            return Err(MetricsError::AlreadyStopped);
        }
        tokio::select! {
            _ = done_rx => Ok(()),
            _ = self.cancel.cancelled() => Err(MetricsError::AlreadyStopped),
        }
    }
}

fn spawn_worker(
    store: Arc<dyn SampleStore>,
    mut rx: mpsc::UnboundedReceiver<IngestCommand>,
    stats: Arc<IngestStats>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let cmd = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = rx.recv() => cmd,
            };
            match cmd {
                Some(IngestCommand::Sample(sample)) => {
                    persist(store.as_ref(), &sample, &stats).await;
                    stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
                }
                Some(IngestCommand::Flush(done)) => {
                    let _ = done.send(());
                }
                None => break,
            }
        }
        discard_queued(&mut rx, &stats);
        tracing::info!(
            persisted = stats.persisted_total.load(Ordering::Relaxed),
            dropped = stats.dropped_total.load(Ordering::Relaxed),
            "ingestion worker stopped"
        );
    })
}

async fn persist(store: &dyn SampleStore, sample: &NewNodeSample, stats: &IngestStats) {
    let started = Instant::now();
    match store.insert(sample).await {
        Ok(row) => {
            let micros = started.elapsed().as_micros() as u64;
            stats.record_insert(micros);
            tracing::debug!(
                node = %row.node_id,
                sequence_id = row.sequence_id,
                micros,
                "persisted sample"
            );
        }
        Err(err) => {
            stats.dropped_total.fetch_add(1, Ordering::Relaxed);
            stats.record_error(err.to_string());
            tracing::warn!(node = %sample.node_id, error = %err, "failed to persist sample; dropping it");
        }
    }
}

fn discard_queued(rx: &mut mpsc::UnboundedReceiver<IngestCommand>, stats: &IngestStats) {
    rx.close();
    let mut dropped = 0u64;
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            IngestCommand::Sample(_) => {
                dropped += 1;
                stats.queue_depth.fetch_sub(1, Ordering::Relaxed);
            }
            IngestCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    if dropped > 0 {
        stats.dropped_total.fetch_add(dropped, Ordering::Relaxed);
        tracing::warn!(dropped, "ingestion stopped with queued samples; dropped them");
    }
}
