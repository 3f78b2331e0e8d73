use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::PgPool;

use super::StoreError;

type Result<T> = std::result::Result<T, StoreError>;

/// One peer of a group's interface. Counters and `last_handshake` are
/// written only by the statistics collector; they are absolute values
/// replaced wholesale on each poll.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Client {
    pub id: i64,
    pub group_id: i64,
    pub name: String,
    pub description: String,
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub assigned_ip: IpNetwork,
    pub assigned_ip_v6: Option<IpNetwork>,
    pub allowed_ips: String,
    pub can_address_peers: bool,
    pub dns_override: Option<String>,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub total_received: i64,
    pub total_sent: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewClient {
    pub group_id: i64,
    pub name: String,
    pub description: String,
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: Option<String>,
    pub assigned_ip: IpNetwork,
    pub assigned_ip_v6: Option<IpNetwork>,
    pub allowed_ips: String,
    pub can_address_peers: bool,
    pub dns_override: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Field-wise client update; `None` leaves the column untouched. An empty
/// `dns_override` clears the override back to the group default.
#[derive(Debug, Default)]
pub struct ClientChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub allowed_ips: Option<String>,
    pub can_address_peers: Option<bool>,
    pub dns_override: Option<String>,
    pub is_active: Option<bool>,
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

/// Aggregate traffic numbers for a set of clients.
#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct TrafficTotals {
    pub total_clients: i64,
    pub active_clients: i64,
    pub total_received: i64,
    pub total_sent: i64,
}

#[derive(Debug, Clone)]
pub struct ClientStore {
    pool: PgPool,
}

impl ClientStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, new), fields(group_id = new.group_id, name = %new.name))]
    pub async fn create(&self, new: &NewClient) -> Result<Client> {
        sqlx::query_as::<_, Client>(
            "INSERT INTO clients (group_id, name, description, private_key,
                public_key, preshared_key, assigned_ip, assigned_ip_v6,
                allowed_ips, can_address_peers, dns_override, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING *",
        )
        .bind(new.group_id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(&new.private_key)
        .bind(&new.public_key)
        .bind(&new.preshared_key)
        .bind(new.assigned_ip)
        .bind(new.assigned_ip_v6)
        .bind(&new.allowed_ips)
        .bind(new.can_address_peers)
        .bind(&new.dns_override)
        .bind(new.expires_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err)
                if db_err.constraint() == Some("clients_group_id_assigned_ip_key") =>
            {
                StoreError::AddressTaken
            }
            _ => StoreError::Database(e),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<Client>> {
        sqlx::query_as::<_, Client>("SELECT * FROM clients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// All clients of a group in id order (the render order).
    #[tracing::instrument(skip(self))]
    pub async fn list_by_group(&self, group_id: i64) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>(
            "SELECT * FROM clients WHERE group_id = $1 ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_active_by_group(&self, group_id: i64) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>(
            "SELECT * FROM clients WHERE group_id = $1 AND is_active ORDER BY id",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Every address already assigned in the group, active clients or not.
    #[tracing::instrument(skip(self))]
    pub async fn used_addresses(
        &self,
        group_id: i64,
    ) -> Result<(Vec<IpNetwork>, Vec<IpNetwork>)> {
        let rows: Vec<(IpNetwork, Option<IpNetwork>)> = sqlx::query_as(
            "SELECT assigned_ip, assigned_ip_v6 FROM clients WHERE group_id = $1",
        )
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;

        let mut v4 = Vec::with_capacity(rows.len());
        let mut v6 = Vec::new();
        for (ip, ip_v6) in rows {
            v4.push(ip);
            if let Some(ip_v6) = ip_v6 {
                v6.push(ip_v6);
            }
        }
        Ok((v4, v6))
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update(&self, id: i64, changes: &ClientChanges) -> Result<Option<Client>> {
        let client = sqlx::query_as::<_, Client>(
            "UPDATE clients SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                allowed_ips = COALESCE($4, allowed_ips),
                can_address_peers = COALESCE($5, can_address_peers),
                dns_override = NULLIF(COALESCE($6, dns_override), ''),
                is_active = COALESCE($7, is_active),
                updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&changes.name)
        .bind(&changes.description)
        .bind(&changes.allowed_ips)
        .bind(changes.can_address_peers)
        .bind(&changes.dns_override)
        .bind(changes.is_active)
        .fetch_optional(&self.pool)
        .await?;

        let Some(client) = client else {
            return Ok(None);
        };

        if let Some(expires_at) = changes.expires_at {
            return sqlx::query_as::<_, Client>(
                "UPDATE clients SET expires_at = $2, updated_at = now()
                 WHERE id = $1 RETURNING *",
            )
            .bind(id)
            .bind(expires_at)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into);
        }

        Ok(Some(client))
    }

    /// Replace a client's key material wholesale.
    #[tracing::instrument(skip(self, private_key, public_key, preshared_key))]
    pub async fn set_keys(
        &self,
        id: i64,
        private_key: &str,
        public_key: &str,
        preshared_key: Option<&str>,
    ) -> Result<Option<Client>> {
        sqlx::query_as::<_, Client>(
            "UPDATE clients SET private_key = $2, public_key = $3,
                preshared_key = $4, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(private_key)
        .bind(public_key)
        .bind(preshared_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Overwrite the live counters for the peer with this public key.
    /// Absolute values, not deltas.
    #[tracing::instrument(skip(self, public_key))]
    pub async fn update_stats(
        &self,
        group_id: i64,
        public_key: &str,
        last_handshake: Option<DateTime<Utc>>,
        total_received: i64,
        total_sent: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE clients SET last_handshake = $3, total_received = $4,
                total_sent = $5, updated_at = now()
             WHERE group_id = $1 AND public_key = $2",
        )
        .bind(group_id)
        .bind(public_key)
        .bind(last_handshake)
        .bind(total_received)
        .bind(total_sent)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deactivate every active client whose expiry has passed, returning the
    /// affected rows so their groups can be resynced.
    #[tracing::instrument(skip(self))]
    pub async fn deactivate_expired(&self, now: DateTime<Utc>) -> Result<Vec<Client>> {
        sqlx::query_as::<_, Client>(
            "UPDATE clients SET is_active = FALSE, updated_at = now()
             WHERE is_active AND expires_at IS NOT NULL AND expires_at <= $1
             RETURNING *",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM clients WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // -- Aggregates ----------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn totals(&self) -> Result<TrafficTotals> {
        sqlx::query_as::<_, TrafficTotals>(
            "SELECT COUNT(*) AS total_clients,
                    COUNT(*) FILTER (WHERE is_active) AS active_clients,
                    COALESCE(SUM(total_received), 0)::BIGINT AS total_received,
                    COALESCE(SUM(total_sent), 0)::BIGINT AS total_sent
             FROM clients",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self, group_ids))]
    pub async fn totals_for_groups(&self, group_ids: &[i64]) -> Result<TrafficTotals> {
        sqlx::query_as::<_, TrafficTotals>(
            "SELECT COUNT(*) AS total_clients,
                    COUNT(*) FILTER (WHERE is_active) AS active_clients,
                    COALESCE(SUM(total_received), 0)::BIGINT AS total_received,
                    COALESCE(SUM(total_sent), 0)::BIGINT AS total_sent
             FROM clients WHERE group_id = ANY($1)",
        )
        .bind(group_ids)
        .fetch_one(&self.pool)
        .await
        .map_err(Into::into)
    }
}
