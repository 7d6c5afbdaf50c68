use crate::uptime::{UptimeOptions, DEFAULT_GAP_THRESHOLD_SECONDS};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_value(key).and_then(|value| value.parse::<T>().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    env_value(key).map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn setup_config_path() -> Option<PathBuf> {
    env_value("NODELOG_SETUP_CONFIG_PATH").map(PathBuf::from)
}

#[derive(Debug, Clone, Default, Deserialize)]
struct SetupConfigOverrides {
    #[serde(default)]
    database_url: Option<String>,
    #[serde(default)]
    cache_dir: Option<String>,
    #[serde(default)]
    uptime_start_time: Option<String>,
    #[serde(default)]
    uptime_end_time: Option<String>,
    #[serde(default)]
    gap_threshold_seconds: Option<u64>,
    #[serde(default)]
    network_height_floor: Option<u64>,
    #[serde(default)]
    node_ids: Option<Vec<String>>,
    #[serde(default)]
    recompute_interval_secs: Option<u64>,
}

fn load_setup_config_overrides() -> Option<SetupConfigOverrides> {
    let path = setup_config_path()?;
    if !path.exists() {
        tracing::warn!(path = %path.display(), "nodelog setup config not found; using env defaults");
        return None;
    }
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "nodelog failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    match parse_setup_config(contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "nodelog failed to parse setup config; using env defaults"
            );
            None
        }
    }
}

fn parse_setup_config(contents: String) -> Result<SetupConfigOverrides, simd_json::Error> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes)
}

/// Setup-file values only fill in what the environment left unset.
fn apply_setup_overrides(config: &mut Config, overrides: &SetupConfigOverrides) -> Result<()> {
    let env_allows = |key: &str| env_value(key).is_none();
    let non_empty = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if env_allows("NODELOG_CACHE_DIR") {
        if let Some(dir) = non_empty(&overrides.cache_dir) {
            config.cache_dir = PathBuf::from(dir);
        }
    }
    if env_allows("UPTIME_START_TIME") {
        if let Some(value) = non_empty(&overrides.uptime_start_time) {
            config.uptime_start_time = Some(parse_timestamp("uptime_start_time", &value)?);
        }
    }
    if env_allows("UPTIME_END_TIME") {
        if let Some(value) = non_empty(&overrides.uptime_end_time) {
            config.uptime_end_time = Some(parse_timestamp("uptime_end_time", &value)?);
        }
    }
    if env_allows("NODELOG_GAP_THRESHOLD_SECONDS") {
        if let Some(value) = overrides.gap_threshold_seconds.filter(|v| *v != 0) {
            config.gap_threshold_seconds = value;
        }
    }
    if env_allows("NODELOG_NETWORK_HEIGHT_FLOOR") {
        if let Some(value) = overrides.network_height_floor {
            config.network_height_floor = value;
        }
    }
    if env_allows("NODELOG_NODE_IDS") {
        if let Some(node_ids) = overrides.node_ids.as_ref() {
            let node_ids = clean_node_ids(node_ids.iter().map(String::as_str));
            if !node_ids.is_empty() {
                config.node_ids = Some(node_ids);
            }
        }
    }
    if env_allows("NODELOG_RECOMPUTE_INTERVAL_SECS") {
        if let Some(value) = overrides.recompute_interval_secs {
            config.recompute_interval_secs = value;
        }
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub db_pool_size: u32,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub uptime_start_time: Option<DateTime<Utc>>,
    pub uptime_end_time: Option<DateTime<Utc>>,
    pub gap_threshold_seconds: u64,
    pub network_height_floor: u64,
    pub node_ids: Option<Vec<String>>,
    pub reverse_node_order: bool,
    pub recompute_timeout_secs: u64,
    pub recompute_interval_secs: u64,
    pub persist_uptime: bool,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let setup_overrides = load_setup_config_overrides();

        let database_url = env_value("NODELOG_DATABASE_URL")
            .or_else(|| env_value("DATABASE_URL"))
            .or_else(postgres_url_from_parts)
            .or_else(|| {
                setup_overrides
                    .as_ref()
                    .and_then(|ov| ov.database_url.as_deref())
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(|value| value.to_string())
            })
            .context("NODELOG_DATABASE_URL, DATABASE_URL or POSTGRES_HOST/POSTGRES_DB is required (or present as database_url in the setup config)")?;
        let database_url = normalize_database_url(database_url);

        let uptime_start_time = env_value("UPTIME_START_TIME")
            .map(|value| parse_timestamp("UPTIME_START_TIME", &value))
            .transpose()?;
        let uptime_end_time = env_value("UPTIME_END_TIME")
            .map(|value| parse_timestamp("UPTIME_END_TIME", &value))
            .transpose()?;

        let mut config = Self {
            database_url,
            db_pool_size: env_parse("NODELOG_DB_POOL_SIZE").unwrap_or(10),
            cache_dir: env_value("NODELOG_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cache")),
            cache_enabled: env_flag("NODELOG_CACHE_ENABLED").unwrap_or(true),
            uptime_start_time,
            uptime_end_time,
            gap_threshold_seconds: env_parse::<u64>("NODELOG_GAP_THRESHOLD_SECONDS")
                .filter(|v| *v != 0)
                .unwrap_or(DEFAULT_GAP_THRESHOLD_SECONDS),
            network_height_floor: env_parse("NODELOG_NETWORK_HEIGHT_FLOOR").unwrap_or(0),
            node_ids: env_value("NODELOG_NODE_IDS")
                .map(|value| clean_node_ids(value.split(',')))
                .filter(|ids| !ids.is_empty()),
            reverse_node_order: env_flag("NODELOG_REVERSE_NODE_ORDER").unwrap_or(false),
            recompute_timeout_secs: env_parse::<u64>("NODELOG_RECOMPUTE_TIMEOUT_SECS")
                .filter(|v| *v != 0)
                .unwrap_or(300),
            recompute_interval_secs: env_parse("NODELOG_RECOMPUTE_INTERVAL_SECS").unwrap_or(3600),
            persist_uptime: env_flag("NODELOG_PERSIST_UPTIME").unwrap_or(true),
            otlp_endpoint: env_value("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = setup_overrides.as_ref() {
            apply_setup_overrides(&mut config, overrides)?;
        }

        Ok(config)
    }

    pub fn uptime_options(&self) -> UptimeOptions {
        UptimeOptions {
            gap_threshold_seconds: self.gap_threshold_seconds,
            height_floor: self.network_height_floor,
            recompute_timeout: Duration::from_secs(self.recompute_timeout_secs),
            persist: self.persist_uptime,
        }
    }

    /// The fixed recompute window; stable across runs so cached segments
    /// stay reusable.
    pub fn uptime_window(&self) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self
            .uptime_start_time
            .context("UPTIME_START_TIME is required for uptime recompute")?;
        let end = self
            .uptime_end_time
            .context("UPTIME_END_TIME is required for uptime recompute")?;
        anyhow::ensure!(start < end, "UPTIME_START_TIME must be before UPTIME_END_TIME");
        Ok((start, end))
    }

    pub fn recompute_interval(&self) -> Option<Duration> {
        (self.recompute_interval_secs != 0).then(|| Duration::from_secs(self.recompute_interval_secs))
    }
}

fn parse_timestamp(key: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .with_context(|| format!("{key} must be an RFC 3339 timestamp, got {value:?}"))
}

fn clean_node_ids<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    ids.into_iter()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn postgres_url_from_parts() -> Option<String> {
    let host = env_value("POSTGRES_HOST")?;
    let db = env_value("POSTGRES_DB")?;
    Some(compose_postgres_url(
        &host,
        env_value("POSTGRES_PORT").as_deref(),
        env_value("POSTGRES_USER").as_deref(),
        env_value("POSTGRES_PASSWORD").as_deref(),
        &db,
    ))
}

fn compose_postgres_url(
    host: &str,
    port: Option<&str>,
    user: Option<&str>,
    password: Option<&str>,
    db: &str,
) -> String {
    let credentials = match (user, password) {
        (Some(user), Some(password)) => format!("{user}:{password}@"),
        (Some(user), None) => format!("{user}@"),
        _ => String::new(),
    };
    let port = port.unwrap_or("5432");
    format!("postgresql://{credentials}{host}:{port}/{db}")
}

fn normalize_database_url(url: String) -> String {
    if let Some(stripped) = url.strip_prefix("postgresql+psycopg://") {
        return format!("postgresql://{stripped}");
    }
    if let Some(stripped) = url.strip_prefix("postgresql+asyncpg://") {
        return format!("postgresql://{stripped}");
    }
    url
}
