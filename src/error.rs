use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache entry codec: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("sample store unavailable: {0}")]
    StoreUnavailable(#[from] sqlx::Error),
    #[error("no samples for node {node_id}")]
    NotFound { node_id: String },
    #[error("result cache unavailable: {0}")]
    CacheUnavailable(#[from] CacheError),
    #[error("ingestion buffer already stopped")]
    AlreadyStopped,
    #[error("uptime recompute for node {node_id} timed out after {after:?}")]
    Timeout { node_id: String, after: Duration },
    #[error("uptime recompute cancelled")]
    Cancelled,
    #[error("node {node_id}: {source}")]
    Node {
        node_id: String,
        #[source]
        source: Box<MetricsError>,
    },
}

impl MetricsError {
    pub fn not_found(node_id: impl Into<String>) -> Self {
        MetricsError::NotFound {
            node_id: node_id.into(),
        }
    }

    /// Attaches the node id unless the error already names it.
    pub fn for_node(self, node_id: &str) -> Self {
        match self {
            err @ (MetricsError::NotFound { .. }
            | MetricsError::Timeout { .. }
            | MetricsError::Node { .. }
            | MetricsError::Cancelled) => err,
            other => MetricsError::Node {
                node_id: node_id.to_string(),
                source: Box::new(other),
            },
        }
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            MetricsError::NotFound { node_id }
            | MetricsError::Timeout { node_id, .. }
            | MetricsError::Node { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            MetricsError::NotFound { .. } => true,
            MetricsError::Node { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_store_unavailable(&self) -> bool {
        match self {
            MetricsError::StoreUnavailable(_) => true,
            MetricsError::Node { source, .. } => source.is_store_unavailable(),
            _ => false,
        }
    }
}

pub type MetricsResult<T> = Result<T, MetricsError>;
