use anyhow::{Context, Result};
use futures::future;
use nodelog::cache::{DiskCache, NoopCache, ResultCache};
use nodelog::config::Config;
use nodelog::metrics::NodeMetrics;
use nodelog::store::{build_pool, PgSampleStore};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,nodelog=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "nodelog"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

fn open_cache(config: &Config) -> Result<Arc<dyn ResultCache>> {
    if !config.cache_enabled {
        tracing::info!("result cache disabled");
        return Ok(Arc::new(NoopCache));
    }
    let cache = DiskCache::open(&config.cache_dir).with_context(|| {
        format!("failed to open result cache at {}", config.cache_dir.display())
    })?;
    tracing::info!(dir = %cache.dir().display(), "result cache ready");
    Ok(Arc::new(cache))
}

async fn run_once(config: &Config, metrics: &NodeMetrics) -> Result<()> {
    let (start, end) = config.uptime_window()?;
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received; cancelling recompute");
            signal_cancel.cancel();
        }
    });

    let samples = metrics.recompute_uptime_for_all(start, end, &cancel).await?;
    tracing::info!(nodes = samples.len(), "uptime recompute complete");
    Ok(())
}

/// Runs the periodic recompute job until Ctrl-C. The ingestion buffer is
/// started for collectors that embed the library and feed it through
/// [`NodeMetrics::ingest`]; stopping it on shutdown drops what they left queued.
async fn run_service(config: &Config, metrics: Arc<NodeMetrics>) -> Result<()> {
    metrics.start_ingestion()?;
    let cancel = CancellationToken::new();

    let window = match config.uptime_window() {
        Ok(window) => Some(window),
        Err(err) => {
            tracing::warn!(error = %err, "uptime window not configured; recompute job disabled");
            None
        }
    };
    let recompute_handle = match (config.recompute_interval(), window) {
        (Some(interval), Some((start, end))) => {
            let metrics = metrics.clone();
            let cancel = cancel.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = metrics.recompute_uptime_for_all(start, end, &cancel).await {
                        tracing::warn!(
                            error = %err,
                            node = err.node_id().unwrap_or("-"),
                            "uptime recompute failed"
                        );
                    }
                }
            }))
        }
        _ => None,
    };

    tokio::select! {
        _ = async {
            if let Some(handle) = recompute_handle {
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "recompute task failed");
                }
            } else {
                future::pending::<()>().await;
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    metrics.stop_ingestion().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let pool = build_pool(&config.database_url, config.db_pool_size).await?;
    let store = PgSampleStore::new(pool);
    store
        .ensure_schema()
        .await
        .context("failed to prepare node_samples schema")?;
    let cache = open_cache(&config)?;

    let metrics = Arc::new(
        NodeMetrics::new(Arc::new(store), cache, config.uptime_options())
            .with_node_ids(config.node_ids.clone())
            .with_reverse_node_order(config.reverse_node_order),
    );

    match std::env::args().nth(1).as_deref() {
        Some("recompute") => run_once(&config, &metrics).await,
        None => run_service(&config, metrics).await,
        Some(other) => anyhow::bail!("unknown command {other:?}; expected `recompute` or no argument"),
    }
}
