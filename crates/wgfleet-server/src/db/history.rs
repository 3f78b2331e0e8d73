use chrono::{DateTime, Utc};
use sqlx::PgPool;

use super::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// One point on a traffic chart. `client_id` and `group_id` are both set for
/// per-client samples, only `group_id` for group aggregates, and neither for
/// system-wide snapshots.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct TrafficSample {
    pub id: i64,
    pub client_id: Option<i64>,
    pub group_id: Option<i64>,
    pub received_bytes: i64,
    pub sent_bytes: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: PgPool,
}

impl HistoryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn record(
        &self,
        client_id: Option<i64>,
        group_id: Option<i64>,
        received_bytes: i64,
        sent_bytes: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO traffic_history (client_id, group_id, received_bytes, sent_bytes)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(client_id)
        .bind(group_id)
        .bind(received_bytes)
        .bind(sent_bytes)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM traffic_history WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    #[tracing::instrument(skip(self))]
    pub async fn client_series(
        &self,
        client_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrafficSample>> {
        sqlx::query_as::<_, TrafficSample>(
            "SELECT * FROM traffic_history
             WHERE client_id = $1 AND recorded_at >= $2
             ORDER BY recorded_at",
        )
        .bind(client_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn group_series(
        &self,
        group_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrafficSample>> {
        sqlx::query_as::<_, TrafficSample>(
            "SELECT * FROM traffic_history
             WHERE group_id = $1 AND client_id IS NULL AND recorded_at >= $2
             ORDER BY recorded_at",
        )
        .bind(group_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn system_series(&self, since: DateTime<Utc>) -> Result<Vec<TrafficSample>> {
        sqlx::query_as::<_, TrafficSample>(
            "SELECT * FROM traffic_history
             WHERE group_id IS NULL AND client_id IS NULL AND recorded_at >= $1
             ORDER BY recorded_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }
}
