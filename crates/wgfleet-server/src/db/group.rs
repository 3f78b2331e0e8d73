use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use sqlx::PgPool;

use super::StoreError;
use crate::wg::ifname;

type Result<T> = std::result::Result<T, StoreError>;

/// One WireGuard interface: its key pair, address ranges, network
/// parameters, and ownership. `is_running` is a best-effort cache of the
/// OS-level interface state, refreshed after each successful start/stop and
/// consulted on process startup to re-establish interfaces.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub interface_name: String,
    pub server_private_key: String,
    pub server_public_key: String,
    pub ip_range: IpNetwork,
    pub server_ip: IpNetwork,
    pub ip_range_v6: Option<IpNetwork>,
    pub server_ip_v6: Option<IpNetwork>,
    pub listen_port: i32,
    pub dns: String,
    pub endpoint: String,
    pub persistent_keepalive: i32,
    pub mtu: i32,
    pub allow_client_to_client: bool,
    pub is_running: bool,
    pub owner_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewGroup {
    pub name: String,
    pub description: String,
    pub server_private_key: String,
    pub server_public_key: String,
    pub ip_range: IpNetwork,
    pub server_ip: IpNetwork,
    pub ip_range_v6: Option<IpNetwork>,
    pub server_ip_v6: Option<IpNetwork>,
    pub listen_port: Option<i32>,
    pub dns: String,
    pub endpoint: String,
    pub persistent_keepalive: i32,
    pub mtu: i32,
    pub allow_client_to_client: bool,
    pub owner_id: i64,
}

/// Field-wise group update; `None` leaves the column untouched.
#[derive(Debug, Default)]
pub struct GroupChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub dns: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<i32>,
    pub mtu: Option<i32>,
    pub allow_client_to_client: Option<bool>,
    pub listen_port: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct GroupStore {
    pool: PgPool,
}

impl GroupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a group. The id is drawn from the sequence up front so the
    /// interface name and the derived listen port can be computed before the
    /// row exists; an interface-name collision is retried once with the
    /// group id folded into the name.
    #[tracing::instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create(&self, new: &NewGroup, base_port: i32) -> Result<Group> {
        let (id,): (i64,) = sqlx::query_as("SELECT nextval('groups_id_seq')")
            .fetch_one(&self.pool)
            .await?;

        let interface_name = ifname::sanitize_interface_name(&new.name, id);
        match self.insert(id, new, &interface_name, base_port).await {
            Err(StoreError::InterfaceNameTaken) => {
                let disambiguated = ifname::sanitize_interface_name_with_id(&new.name, id);
                tracing::info!(
                    interface = %disambiguated,
                    "interface name collision, retrying with id suffix"
                );
                self.insert(id, new, &disambiguated, base_port).await
            }
            other => other,
        }
    }

    async fn insert(
        &self,
        id: i64,
        new: &NewGroup,
        interface_name: &str,
        base_port: i32,
    ) -> Result<Group> {
        let listen_port = new
            .listen_port
            .unwrap_or_else(|| derive_listen_port(base_port, id));

        sqlx::query_as::<_, Group>(
            "INSERT INTO groups (id, name, description, interface_name,
                server_private_key, server_public_key, ip_range, server_ip,
                ip_range_v6, server_ip_v6, listen_port, dns, endpoint,
                persistent_keepalive, mtu, allow_client_to_client, owner_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             RETURNING *",
        )
        .bind(id)
        .bind(&new.name)
        .bind(&new.description)
        .bind(interface_name)
        .bind(&new.server_private_key)
        .bind(&new.server_public_key)
        .bind(new.ip_range)
        .bind(new.server_ip)
        .bind(new.ip_range_v6)
        .bind(new.server_ip_v6)
        .bind(listen_port)
        .bind(&new.dns)
        .bind(&new.endpoint)
        .bind(new.persistent_keepalive)
        .bind(new.mtu)
        .bind(new.allow_client_to_client)
        .bind(new.owner_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) => match db_err.constraint() {
                Some("groups_interface_name_key") => StoreError::InterfaceNameTaken,
                Some("groups_listen_port_key") => StoreError::ListenPortTaken,
                _ => StoreError::Database(e),
            },
            _ => StoreError::Database(e),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<Group>> {
        sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<Group>> {
        sqlx::query_as::<_, Group>("SELECT * FROM groups ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    /// Groups the user owns or is a member of.
    #[tracing::instrument(skip(self))]
    pub async fn list_for_user(&self, user_id: i64) -> Result<Vec<Group>> {
        sqlx::query_as::<_, Group>(
            "SELECT DISTINCT g.* FROM groups g
             LEFT JOIN group_members m ON m.group_id = g.id
             WHERE g.owner_id = $1 OR m.user_id = $1
             ORDER BY g.id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Into::into)
    }

    /// Groups whose interface should be up, used for startup recovery.
    #[tracing::instrument(skip(self))]
    pub async fn list_running(&self) -> Result<Vec<Group>> {
        sqlx::query_as::<_, Group>("SELECT * FROM groups WHERE is_running ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(Into::into)
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update(&self, id: i64, changes: &GroupChanges) -> Result<Option<Group>> {
        sqlx::query_as::<_, Group>(
            "UPDATE groups SET
                name = COALESCE($2, name),
                description = COALESCE($3, description),
                dns = COALESCE($4, dns),
                endpoint = COALESCE($5, endpoint),
                persistent_keepalive = COALESCE($6, persistent_keepalive),
                mtu = COALESCE($7, mtu),
                allow_client_to_client = COALESCE($8, allow_client_to_client),
                listen_port = COALESCE($9, listen_port),
                updated_at = now()
             WHERE id = $1
             RETURNING *",
        )
        .bind(id)
        .bind(&changes.name)
        .bind(&changes.description)
        .bind(&changes.dns)
        .bind(&changes.endpoint)
        .bind(changes.persistent_keepalive)
        .bind(changes.mtu)
        .bind(changes.allow_client_to_client)
        .bind(changes.listen_port)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err)
                if db_err.constraint() == Some("groups_listen_port_key") =>
            {
                StoreError::ListenPortTaken
            }
            _ => StoreError::Database(e),
        })
    }

    /// Set or clear the IPv6 range (and the server's v6 address with it).
    #[tracing::instrument(skip(self))]
    pub async fn set_ipv6_range(
        &self,
        id: i64,
        range: Option<(IpNetwork, IpNetwork)>,
    ) -> Result<Option<Group>> {
        let (ip_range_v6, server_ip_v6) = match range {
            Some((range, server)) => (Some(range), Some(server)),
            None => (None, None),
        };
        sqlx::query_as::<_, Group>(
            "UPDATE groups SET ip_range_v6 = $2, server_ip_v6 = $3, updated_at = now()
             WHERE id = $1 RETURNING *",
        )
        .bind(id)
        .bind(ip_range_v6)
        .bind(server_ip_v6)
        .fetch_optional(&self.pool)
        .await
        .map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_running(&self, id: i64, running: bool) -> Result<()> {
        sqlx::query("UPDATE groups SET is_running = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(running)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Explicit two-phase delete: client rows first, then memberships, then
    /// the group row. Interface teardown and config-file removal happen
    /// before this is called; nothing relies on storage-level cascades.
    #[tracing::instrument(skip(self))]
    pub async fn delete_with_clients(&self, id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM clients WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM group_members WHERE group_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    // -- Membership ----------------------------------------------------------

    #[tracing::instrument(skip(self))]
    pub async fn add_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO group_members (group_id, user_id) VALUES ($1, $2)
             ON CONFLICT DO NOTHING",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_member(&self, group_id: i64, user_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM group_members WHERE group_id = $1 AND user_id = $2",
        )
        .bind(group_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Default listen port for a new group. The id's offset wraps within the
/// space above `base_port` so a very large id cannot overflow past 65535;
/// a wrapped collision surfaces as [`StoreError::ListenPortTaken`] and the
/// caller can pass an explicit port instead.
fn derive_listen_port(base_port: i32, id: i64) -> i32 {
    let span = i64::from(u16::MAX as i32 - base_port).max(1);
    base_port + id.rem_euclid(span) as i32
}

#[cfg(test)]
mod tests {
    use super::derive_listen_port;

    #[test]
    fn small_ids_offset_the_base_port() {
        assert_eq!(derive_listen_port(51820, 1), 51821);
        assert_eq!(derive_listen_port(51820, 100), 51920);
    }

    #[test]
    fn huge_ids_stay_within_the_port_range() {
        for id in [i64::MAX, i64::MAX - 1, 1 << 40] {
            let port = derive_listen_port(51820, id);
            assert!((51820..=65535).contains(&port), "{port}");
        }
    }
}
