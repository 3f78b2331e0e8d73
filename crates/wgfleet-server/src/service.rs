// Copyright (C) 2025 the wgfleet authors
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Orchestration between the database and the WireGuard tooling. Every
//! operation that mutates a group's peers or its interface runs under that
//! group's async lock, so config writes and wg-quick calls never interleave
//! across concurrent requests.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::StoreError;
use crate::db::client::{Client, ClientChanges, ClientStore, NewClient, TrafficTotals};
use crate::db::group::{Group, GroupChanges, GroupStore, NewGroup};
use crate::db::history::HistoryStore;
use crate::wg::interface::InterfaceManager;
use crate::wg::keys::KeyGenerator;
use crate::wg::{SystemRunner, WgError, WgRunner, alloc, render, stats};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wg(#[from] WgError),

    #[error("no free addresses left in the group's range")]
    AllocationExhausted,

    #[error("invalid address range: {0}")]
    InvalidRange(String),

    #[error("group not found")]
    GroupNotFound,

    #[error("client not found")]
    ClientNotFound,
}

type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug)]
pub struct CreateGroup {
    pub name: String,
    pub description: String,
    pub ip_range: Ipv4Network,
    pub ip_range_v6: Option<Ipv6Network>,
    pub listen_port: Option<i32>,
    pub dns: Option<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive: Option<i32>,
    pub mtu: Option<i32>,
    pub allow_client_to_client: bool,
    pub owner_id: i64,
}

#[derive(Debug)]
pub struct CreateClient {
    pub group_id: i64,
    pub name: String,
    pub description: String,
    pub allowed_ips: Option<String>,
    pub can_address_peers: bool,
    pub dns_override: Option<String>,
    pub use_preshared_key: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Defaults applied to groups that do not set their own values, sourced
/// from the environment at startup.
#[derive(Debug, Clone)]
struct Defaults {
    dns: String,
    endpoint: String,
    keepalive: i32,
    mtu: i32,
    base_port: i32,
}

pub struct WgService<R> {
    groups: GroupStore,
    clients: ClientStore,
    history: HistoryStore,
    manager: InterfaceManager<R>,
    keygen: KeyGenerator<R>,
    defaults: Defaults,
    retention_days: i64,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

pub type AppService = WgService<SystemRunner>;

impl<R: WgRunner + Clone> WgService<R> {
    pub fn new(
        groups: GroupStore,
        clients: ClientStore,
        history: HistoryStore,
        runner: R,
        config: &Config,
    ) -> Self {
        Self {
            groups,
            clients,
            history,
            manager: InterfaceManager::new(config.wg_config_root.clone(), runner.clone()),
            keygen: KeyGenerator::new(runner),
            defaults: Defaults {
                dns: config.default_dns.clone(),
                endpoint: config.default_endpoint.clone(),
                keepalive: config.default_keepalive,
                mtu: config.default_mtu,
                base_port: config.base_listen_port,
            },
            retention_days: config.history_retention_days,
            locks: DashMap::new(),
        }
    }

    /// Serialize operations on one group's interface and peer set.
    async fn lock_group(&self, group_id: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(group_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn get_group(&self, group_id: i64) -> Result<Group> {
        self.groups
            .get(group_id)
            .await?
            .ok_or(ServiceError::GroupNotFound)
    }

    async fn get_client(&self, client_id: i64) -> Result<Client> {
        self.clients
            .get(client_id)
            .await?
            .ok_or(ServiceError::ClientNotFound)
    }

    /// Rewrite the group's on-disk configs to match the database, reloading
    /// the interface if it is running. Callers must hold the group lock.
    async fn resync(&self, group: &Group) -> Result<()> {
        let clients = self.clients.list_by_group(group.id).await?;
        self.manager.save_config(group, &clients).await?;
        Ok(())
    }

    /// Resync after a committed row mutation. The database is the source of
    /// truth at this point, so a failed config write is logged and left for
    /// the next sync instead of failing the whole operation.
    async fn resync_logged(&self, group: &Group) {
        if let Err(e) = self.resync(group).await {
            warn!(group_id = group.id, interface = %group.interface_name,
                error = %e, "config sync failed, state will converge on next sync");
        }
    }

    // -- Groups --------------------------------------------------------------

    #[tracing::instrument(skip(self, new), fields(name = %new.name))]
    pub async fn create_group(&self, new: CreateGroup) -> Result<Group> {
        if new.ip_range.prefix() > 30 {
            return Err(ServiceError::InvalidRange(format!(
                "{} leaves no room for clients",
                new.ip_range
            )));
        }
        if let Some(range_v6) = new.ip_range_v6 {
            if range_v6.prefix() > 126 {
                return Err(ServiceError::InvalidRange(format!(
                    "{range_v6} leaves no room for clients"
                )));
            }
        }

        let keypair = self.keygen.generate_keypair().await;
        let server_ip = alloc::first_host_v4(new.ip_range);
        let server_ip_v6 = new.ip_range_v6.map(alloc::first_host_v6);

        let group = self
            .groups
            .create(
                &NewGroup {
                    name: new.name,
                    description: new.description,
                    server_private_key: keypair.private_key,
                    server_public_key: keypair.public_key,
                    ip_range: IpNetwork::V4(new.ip_range),
                    server_ip: IpNetwork::from(IpAddr::V4(server_ip)),
                    ip_range_v6: new.ip_range_v6.map(IpNetwork::V6),
                    server_ip_v6: server_ip_v6.map(|ip| IpNetwork::from(IpAddr::V6(ip))),
                    listen_port: new.listen_port,
                    dns: new.dns.unwrap_or_else(|| self.defaults.dns.clone()),
                    endpoint: new
                        .endpoint
                        .unwrap_or_else(|| self.defaults.endpoint.clone()),
                    persistent_keepalive: new
                        .persistent_keepalive
                        .unwrap_or(self.defaults.keepalive),
                    mtu: new.mtu.unwrap_or(self.defaults.mtu),
                    allow_client_to_client: new.allow_client_to_client,
                    owner_id: new.owner_id,
                },
                self.defaults.base_port,
            )
            .await?;

        self.resync_logged(&group).await;
        info!(group_id = group.id, interface = %group.interface_name, "group created");
        Ok(group)
    }

    /// Update a group's parameters. The interface name stays fixed for the
    /// group's lifetime even when the display name changes.
    #[tracing::instrument(skip(self, changes))]
    pub async fn update_group(&self, group_id: i64, changes: &GroupChanges) -> Result<Group> {
        let _guard = self.lock_group(group_id).await;
        let group = self
            .groups
            .update(group_id, changes)
            .await?
            .ok_or(ServiceError::GroupNotFound)?;
        self.resync_logged(&group).await;
        Ok(group)
    }

    /// Enable or disable the group's IPv6 range. Existing clients keep the
    /// addresses they already have; only newly created clients draw from a
    /// newly enabled range.
    #[tracing::instrument(skip(self))]
    pub async fn set_group_ipv6(
        &self,
        group_id: i64,
        range_v6: Option<Ipv6Network>,
    ) -> Result<Group> {
        if let Some(range_v6) = range_v6 {
            if range_v6.prefix() > 126 {
                return Err(ServiceError::InvalidRange(format!(
                    "{range_v6} leaves no room for clients"
                )));
            }
        }
        let _guard = self.lock_group(group_id).await;
        let pair = range_v6.map(|range| {
            (
                IpNetwork::V6(range),
                IpNetwork::from(IpAddr::V6(alloc::first_host_v6(range))),
            )
        });
        let group = self
            .groups
            .set_ipv6_range(group_id, pair)
            .await?
            .ok_or(ServiceError::GroupNotFound)?;
        self.resync_logged(&group).await;
        Ok(group)
    }

    /// Tear down the interface and remove the group with all its clients.
    /// The interface teardown happens first; if it fails outright the rows
    /// survive so the operation can be retried.
    #[tracing::instrument(skip(self))]
    pub async fn delete_group(&self, group_id: i64) -> Result<()> {
        let _guard = self.lock_group(group_id).await;
        let group = self.get_group(group_id).await?;
        self.manager.delete(&group).await?;
        self.groups.delete_with_clients(group_id).await?;
        self.locks.remove(&group_id);
        info!(group_id, interface = %group.interface_name, "group deleted");
        Ok(())
    }

    /// Flip the interface between running and stopped. Returns the new
    /// running state.
    #[tracing::instrument(skip(self))]
    pub async fn toggle_interface(&self, group_id: i64) -> Result<bool> {
        let _guard = self.lock_group(group_id).await;
        let group = self.get_group(group_id).await?;
        if group.is_running {
            self.manager.stop(&group).await?;
            self.groups.set_running(group_id, false).await?;
            Ok(false)
        } else {
            let clients = self.clients.list_by_group(group_id).await?;
            self.manager.save_config(&group, &clients).await?;
            self.manager.start(&group).await?;
            self.groups.set_running(group_id, true).await?;
            Ok(true)
        }
    }

    /// Render the interface config as the lifecycle controller would write
    /// it, without touching disk.
    pub async fn group_config(&self, group_id: i64) -> Result<String> {
        let group = self.get_group(group_id).await?;
        let clients = self.clients.list_active_by_group(group_id).await?;
        Ok(render::render_server_config(&group, &clients))
    }

    /// Re-establish interfaces recorded as running, typically after a
    /// restart of this process. One broken group does not stop the others.
    #[tracing::instrument(skip(self))]
    pub async fn restore_running_interfaces(&self) -> Result<usize> {
        let groups = self.groups.list_running().await?;
        let mut restored = 0;
        for group in &groups {
            let _guard = self.lock_group(group.id).await;
            match self.resync(group).await {
                Ok(()) => restored += 1,
                Err(e) => {
                    error!(group_id = group.id, interface = %group.interface_name,
                        error = %e, "failed to restore interface");
                }
            }
        }
        info!(restored, total = groups.len(), "startup interface recovery done");
        Ok(restored)
    }

    // -- Clients -------------------------------------------------------------

    #[tracing::instrument(skip(self, new), fields(group_id = new.group_id, name = %new.name))]
    pub async fn create_client(&self, new: CreateClient) -> Result<Client> {
        let _guard = self.lock_group(new.group_id).await;
        let group = self.get_group(new.group_id).await?;

        let (used_v4, used_v6) = self.clients.used_addresses(group.id).await?;
        let assigned_ip = match (group.ip_range, group.server_ip.ip()) {
            (IpNetwork::V4(range), IpAddr::V4(server_ip)) => {
                let used: HashSet<_> = used_v4
                    .iter()
                    .filter_map(|n| match n.ip() {
                        IpAddr::V4(ip) => Some(ip),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                alloc::next_available_ipv4(range, server_ip, &used)
                    .ok_or(ServiceError::AllocationExhausted)?
            }
            _ => {
                return Err(ServiceError::InvalidRange(
                    "group has no usable IPv4 range".to_string(),
                ));
            }
        };

        let assigned_ip_v6 = match (group.ip_range_v6, group.server_ip_v6) {
            (Some(IpNetwork::V6(range)), Some(server)) => {
                let IpAddr::V6(server_ip) = server.ip() else {
                    return Err(ServiceError::InvalidRange(
                        "group IPv6 server address is not IPv6".to_string(),
                    ));
                };
                let used: HashSet<_> = used_v6
                    .iter()
                    .filter_map(|n| match n.ip() {
                        IpAddr::V6(ip) => Some(ip),
                        IpAddr::V4(_) => None,
                    })
                    .collect();
                Some(
                    alloc::next_available_ipv6(range, server_ip, &used)
                        .ok_or(ServiceError::AllocationExhausted)?,
                )
            }
            _ => None,
        };

        let keypair = self.keygen.generate_keypair().await;
        let preshared_key = if new.use_preshared_key {
            Some(self.keygen.generate_preshared_key().await)
        } else {
            None
        };

        let client = self
            .clients
            .create(&NewClient {
                group_id: group.id,
                name: new.name,
                description: new.description,
                private_key: keypair.private_key,
                public_key: keypair.public_key,
                preshared_key,
                assigned_ip: IpNetwork::from(IpAddr::V4(assigned_ip)),
                assigned_ip_v6: assigned_ip_v6.map(|ip| IpNetwork::from(IpAddr::V6(ip))),
                allowed_ips: new
                    .allowed_ips
                    .unwrap_or_else(|| "0.0.0.0/0".to_string()),
                can_address_peers: new.can_address_peers,
                dns_override: new.dns_override,
                expires_at: new.expires_at,
            })
            .await?;

        self.resync_logged(&group).await;
        info!(client_id = client.id, group_id = group.id, "client created");
        Ok(client)
    }

    #[tracing::instrument(skip(self, changes))]
    pub async fn update_client(&self, client_id: i64, changes: &ClientChanges) -> Result<Client> {
        let current = self.get_client(client_id).await?;
        let _guard = self.lock_group(current.group_id).await;
        let client = self
            .clients
            .update(client_id, changes)
            .await?
            .ok_or(ServiceError::ClientNotFound)?;
        let group = self.get_group(client.group_id).await?;
        self.resync_logged(&group).await;
        Ok(client)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_client(&self, client_id: i64) -> Result<()> {
        let client = self.get_client(client_id).await?;
        let _guard = self.lock_group(client.group_id).await;
        if !self.clients.delete(client_id).await? {
            return Err(ServiceError::ClientNotFound);
        }
        let group = self.get_group(client.group_id).await?;
        self.resync_logged(&group).await;
        info!(client_id, group_id = group.id, "client removed");
        Ok(())
    }

    /// Issue a fresh key pair (and preshared key, if the client had one) and
    /// push the new config out.
    #[tracing::instrument(skip(self))]
    pub async fn regenerate_client_keys(&self, client_id: i64) -> Result<Client> {
        let current = self.get_client(client_id).await?;
        let _guard = self.lock_group(current.group_id).await;

        let keypair = self.keygen.generate_keypair().await;
        let preshared_key = if current.preshared_key.is_some() {
            Some(self.keygen.generate_preshared_key().await)
        } else {
            None
        };
        let client = self
            .clients
            .set_keys(
                client_id,
                &keypair.private_key,
                &keypair.public_key,
                preshared_key.as_deref(),
            )
            .await?
            .ok_or(ServiceError::ClientNotFound)?;

        let group = self.get_group(client.group_id).await?;
        self.resync_logged(&group).await;
        Ok(client)
    }

    pub async fn client_config(&self, client_id: i64) -> Result<String> {
        let client = self.get_client(client_id).await?;
        let group = self.get_group(client.group_id).await?;
        Ok(render::render_client_config(&client, &group))
    }

    /// Deactivate clients past their expiry and push updated configs for
    /// the affected groups.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.clients.deactivate_expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let group_ids: HashSet<i64> = expired.iter().map(|c| c.group_id).collect();
        for group_id in group_ids {
            let _guard = self.lock_group(group_id).await;
            match self.get_group(group_id).await {
                Ok(group) => {
                    if let Err(e) = self.resync(&group).await {
                        warn!(group_id, error = %e, "resync after expiry sweep failed");
                    }
                }
                Err(e) => warn!(group_id, error = %e, "expired client's group missing"),
            }
        }
        info!(count = expired.len(), "deactivated expired clients");
        Ok(expired.len())
    }

    // -- Statistics ----------------------------------------------------------

    /// Poll live counters for one group and persist them. Fails fast when
    /// the interface is not running rather than shelling out pointlessly.
    #[tracing::instrument(skip(self))]
    pub async fn poll_group_stats(&self, group_id: i64) -> Result<Vec<Client>> {
        let group = self.get_group(group_id).await?;
        if !group.is_running {
            return Err(ServiceError::Wg(WgError::NotRunning));
        }

        let peer_stats = stats::collect(self.manager.runner(), &group.interface_name).await?;
        let mut clients = self.clients.list_by_group(group_id).await?;
        let updated = stats::merge_into(&mut clients, &peer_stats);

        for client in clients.iter().filter(|c| updated.contains(&c.id)) {
            self.clients
                .update_stats(
                    group_id,
                    &client.public_key,
                    client.last_handshake,
                    client.total_received,
                    client.total_sent,
                )
                .await?;
        }
        Ok(clients)
    }

    /// Persist the group's current counters as history samples, one row per
    /// client plus the group aggregate.
    async fn snapshot_group_history(&self, group_id: i64) -> Result<()> {
        let clients = self.clients.list_by_group(group_id).await?;
        for (client_id, received, sent) in snapshot_rows(&clients) {
            self.history
                .record(client_id, Some(group_id), received, sent)
                .await?;
        }
        Ok(())
    }

    /// One scheduler pass: poll live counters for every running group, then
    /// snapshot history at client, group, and system level for every group,
    /// running or not, and drop samples past retention. A failing group is
    /// logged and skipped so it cannot starve the others.
    #[tracing::instrument(skip(self))]
    pub async fn run_scheduled_collection(&self) -> Result<()> {
        if let Err(e) = self.sweep_expired(Utc::now()).await {
            warn!(error = %e, "expiry sweep failed");
        }

        for group in self.groups.list_all().await? {
            if group.is_running {
                if let Err(e) = self.poll_group_stats(group.id).await {
                    warn!(group_id = group.id, error = %e, "stats poll failed");
                }
            }
            if let Err(e) = self.snapshot_group_history(group.id).await {
                warn!(group_id = group.id, error = %e, "history snapshot failed");
            }
        }

        let totals = self.clients.totals().await?;
        self.history
            .record(None, None, totals.total_received, totals.total_sent)
            .await?;

        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let purged = self.history.purge_before(cutoff).await?;
        if purged > 0 {
            info!(purged, "purged old traffic history");
        }
        Ok(())
    }

    pub async fn traffic_totals(&self) -> Result<TrafficTotals> {
        Ok(self.clients.totals().await?)
    }

    pub async fn traffic_totals_for(&self, group_ids: &[i64]) -> Result<TrafficTotals> {
        Ok(self.clients.totals_for_groups(group_ids).await?)
    }

    // -- Accessors for route handlers ---------------------------------------

    pub fn groups(&self) -> &GroupStore {
        &self.groups
    }

    pub fn clients(&self) -> &ClientStore {
        &self.clients
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }
}

/// History rows for one group's snapshot, as (client_id, received, sent).
/// One row per client plus a `None` row carrying the group aggregate.
fn snapshot_rows(clients: &[Client]) -> Vec<(Option<i64>, i64, i64)> {
    let mut rows: Vec<(Option<i64>, i64, i64)> = clients
        .iter()
        .map(|c| (Some(c.id), c.total_received, c.total_sent))
        .collect();
    let received = clients.iter().map(|c| c.total_received).sum();
    let sent = clients.iter().map(|c| c.total_sent).sum();
    rows.push((None, received, sent));
    rows
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ipnetwork::IpNetwork;

    use crate::db::client::Client;

    use super::snapshot_rows;

    fn counted_client(id: i64, is_active: bool, received: i64, sent: i64) -> Client {
        Client {
            id,
            group_id: 1,
            name: format!("client{id}"),
            description: String::new(),
            private_key: String::new(),
            public_key: format!("PUB{id}"),
            preshared_key: None,
            assigned_ip: "10.0.0.2/32".parse::<IpNetwork>().unwrap(),
            assigned_ip_v6: None,
            allowed_ips: "0.0.0.0/0".into(),
            can_address_peers: false,
            dns_override: None,
            is_active,
            expires_at: None,
            last_handshake: None,
            total_received: received,
            total_sent: sent,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn snapshot_covers_every_client_and_the_aggregate() {
        let clients = vec![
            counted_client(1, true, 100, 10),
            counted_client(2, false, 50, 5),
        ];

        let rows = snapshot_rows(&clients);

        // inactive clients are snapshotted too, their counters still count
        assert_eq!(
            rows,
            vec![(Some(1), 100, 10), (Some(2), 50, 5), (None, 150, 15)]
        );
    }

    #[test]
    fn snapshot_of_empty_group_still_records_the_aggregate() {
        assert_eq!(snapshot_rows(&[]), vec![(None, 0, 0)]);
    }
}
