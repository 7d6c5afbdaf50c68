use super::{GapSum, GapSumQuery, SampleStore};
use crate::error::MetricsResult;
use crate::telemetry::{from_db_i64, to_db_u64, NewNodeSample, NodeSample, NodeType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

const SAMPLE_COLUMNS: &str = r#"
    id,
    created_at,
    node_id,
    node_type,
    network_height,
    head,
    das_total_sampled_headers,
    start_time,
    accumulated_runtime_seconds,
    uptime_score,
    recomputed_uptime_score
"#;

pub async fn build_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

#[derive(Clone)]
pub struct PgSampleStore {
    pool: PgPool,
}

impl PgSampleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ensure_schema(&self) -> MetricsResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS node_samples (
                id bigserial primary key,
                created_at timestamptz not null default now(),
                node_id varchar(255) not null,
                node_type smallint not null,
                network_height bigint not null default 0,
                head bigint not null default 0,
                das_total_sampled_headers bigint not null default 0,
                start_time timestamptz null,
                accumulated_runtime_seconds bigint not null default 0,
                uptime_score real not null default 0,
                recomputed_uptime_score real null
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS node_samples_node_id_id_idx ON node_samples (node_id, id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS node_samples_created_at_idx ON node_samples (created_at)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn sample_from_row(row: &PgRow) -> Result<NodeSample, sqlx::Error> {
    let raw_type = row.try_get::<i16, _>("node_type")?;
    let node_type = NodeType::from_db(raw_type)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown node_type {raw_type}").into()))?;

    Ok(NodeSample {
        sequence_id: from_db_i64(row.try_get::<i64, _>("id")?),
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        node_id: row.try_get::<String, _>("node_id")?,
        node_type,
        network_height: from_db_i64(row.try_get::<i64, _>("network_height")?),
        head: from_db_i64(row.try_get::<i64, _>("head")?),
        das_total_sampled_headers: from_db_i64(
            row.try_get::<i64, _>("das_total_sampled_headers")?,
        ),
        start_time: row.try_get::<Option<DateTime<Utc>>, _>("start_time")?,
        accumulated_runtime_seconds: from_db_i64(
            row.try_get::<i64, _>("accumulated_runtime_seconds")?,
        ),
        uptime_score: row.try_get::<f32, _>("uptime_score")?,
        recomputed_uptime_score: row.try_get::<Option<f32>, _>("recomputed_uptime_score")?,
    })
}

#[async_trait]
impl SampleStore for PgSampleStore {
    async fn insert(&self, sample: &NewNodeSample) -> MetricsResult<NodeSample> {
        let sql = format!(
            r#"
            INSERT INTO node_samples (
                node_id,
                node_type,
                network_height,
                head,
                das_total_sampled_headers,
                start_time,
                accumulated_runtime_seconds,
                uptime_score
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {SAMPLE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(&sample.node_id)
            .bind(sample.node_type.as_db())
            .bind(to_db_u64(sample.network_height))
            .bind(to_db_u64(sample.head))
            .bind(to_db_u64(sample.das_total_sampled_headers))
            .bind(sample.start_time)
            .bind(to_db_u64(sample.accumulated_runtime_seconds))
            .bind(sample.uptime_score)
            .fetch_one(&self.pool)
            .await?;
        Ok(sample_from_row(&row)?)
    }

    async fn latest_sample(&self, node_id: &str) -> MetricsResult<Option<NodeSample>> {
        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM node_samples
            WHERE node_id = $1
            ORDER BY id DESC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(sample_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn sample_at_or_after(
        &self,
        node_id: &str,
        at: DateTime<Utc>,
    ) -> MetricsResult<Option<NodeSample>> {
        let sql = format!(
            r#"
            SELECT {SAMPLE_COLUMNS}
            FROM node_samples
            WHERE node_id = $1
              AND created_at >= $2
            ORDER BY id ASC
            LIMIT 1
            "#
        );
        let row = sqlx::query(&sql)
            .bind(node_id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(sample_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn network_height_before(&self, before: DateTime<Utc>) -> MetricsResult<u64> {
        let height: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT MAX(network_height)
            FROM node_samples
            WHERE created_at < $1
            "#,
        )
        .bind(before)
        .fetch_one(&self.pool)
        .await?;
        Ok(height.map(from_db_i64).unwrap_or(0))
    }

    async fn gap_sum(&self, query: &GapSumQuery) -> MetricsResult<GapSum> {
        // Successors are looked up without the time bound so the last sample
        // before `end_time` still gets its gap once the next heartbeat lands.
        // The scan stops at the first row at or after `end_time`.
        let row = sqlx::query(
            r#"
            WITH closing AS (
                SELECT (
                    SELECT id
                    FROM node_samples
                    WHERE node_id = $1
                      AND id > $2
                      AND created_at >= $3
                    ORDER BY id
                    LIMIT 1
                ) AS id
            ),
            ordered AS (
                SELECT
                    s.id,
                    s.created_at,
                    s.network_height,
                    LEAD(s.created_at) OVER (ORDER BY s.id) AS next_created_at
                FROM node_samples s, closing c
                WHERE s.node_id = $1
                  AND s.id > $2
                  AND (c.id IS NULL OR s.id <= c.id)
            ),
            resolved AS (
                SELECT
                    id,
                    (FLOOR(EXTRACT(EPOCH FROM next_created_at))
                        - FLOOR(EXTRACT(EPOCH FROM created_at)))::bigint AS gap_seconds
                FROM ordered
                WHERE next_created_at IS NOT NULL
                  AND created_at < $3
                  AND network_height > $4
            )
            SELECT
                MAX(id) AS processed_through_id,
                COALESCE(SUM(gap_seconds) FILTER (WHERE gap_seconds < $5), 0)::bigint AS gap_seconds,
                (SELECT MAX(id) FROM node_samples WHERE node_id = $1) AS observed_through_id,
                (SELECT id IS NOT NULL FROM closing) AS closed
            FROM resolved
            "#,
        )
        .bind(&query.node_id)
        .bind(to_db_u64(query.after_id))
        .bind(query.end_time)
        .bind(to_db_u64(query.height_floor))
        .bind(to_db_u64(query.gap_threshold_seconds))
        .fetch_one(&self.pool)
        .await?;

        let processed = row.try_get::<Option<i64>, _>("processed_through_id")?;
        let gap_seconds = row.try_get::<i64, _>("gap_seconds")?;
        let observed = row
            .try_get::<Option<i64>, _>("observed_through_id")?
            .map(from_db_i64)
            .unwrap_or(query.after_id);
        let closed = row.try_get::<Option<bool>, _>("closed")?.unwrap_or(false);

        Ok(GapSum {
            processed_through_id: processed
                .map(from_db_i64)
                .unwrap_or(query.after_id)
                .max(query.after_id),
            gap_seconds: from_db_i64(gap_seconds),
            observed_through_id: observed,
            closed,
        })
    }

    async fn store_uptime(
        &self,
        node_id: &str,
        runtime_seconds: u64,
        uptime_score: f32,
    ) -> MetricsResult<Option<NodeSample>> {
        let sql = format!(
            r#"
            UPDATE node_samples
            SET accumulated_runtime_seconds = $2,
                recomputed_uptime_score = $3
            WHERE id = (SELECT MAX(id) FROM node_samples WHERE node_id = $1)
            RETURNING {SAMPLE_COLUMNS}
            "#
        );
        let row = sqlx::query(&sql)
            .bind(node_id)
            .bind(to_db_u64(runtime_seconds))
            .bind(uptime_score)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(sample_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn node_ids(&self) -> MetricsResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT node_id
            FROM node_samples
            ORDER BY node_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
