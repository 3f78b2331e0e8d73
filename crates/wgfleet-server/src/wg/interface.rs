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

//! Lifecycle of the on-disk interface config and the running interface,
//! driven through `wg-quick`. Callers are expected to hold the group lock
//! for the duration of any mutating call.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::db::client::Client;
use crate::db::group::Group;

use super::{Result, WgError, WgRunner, render};

#[derive(Debug, Clone)]
pub struct InterfaceManager<R> {
    config_root: PathBuf,
    runner: R,
}

impl<R: WgRunner> InterfaceManager<R> {
    pub fn new(config_root: impl Into<PathBuf>, runner: R) -> Self {
        Self {
            config_root: config_root.into(),
            runner,
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Path of the interface config, `<root>/<interface_name>.conf`.
    pub fn config_path(&self, group: &Group) -> PathBuf {
        self.config_root.join(format!("{}.conf", group.interface_name))
    }

    /// Per-group directory of exported client configs.
    pub fn client_config_dir(&self, group: &Group) -> PathBuf {
        self.config_root.join(&group.interface_name)
    }

    /// Write the interface config plus one exported config per active
    /// client, pruning exports for clients no longer active. If the
    /// interface is currently running, it is reloaded so the kernel state
    /// matches what was just written.
    #[tracing::instrument(skip(self, group, clients), fields(interface = %group.interface_name))]
    pub async fn save_config(&self, group: &Group, clients: &[Client]) -> Result<()> {
        let active: Vec<Client> = clients.iter().filter(|c| c.is_active).cloned().collect();

        tokio::fs::create_dir_all(&self.config_root).await?;
        let path = self.config_path(group);
        write_restricted(&path, &render::render_server_config(group, &active)).await?;

        let client_dir = self.client_config_dir(group);
        tokio::fs::create_dir_all(&client_dir).await?;
        let mut expected = Vec::with_capacity(active.len());
        for client in &active {
            let stem = super::ifname::client_config_stem(&client.name, client.id);
            let file = format!("{stem}.conf");
            write_restricted(
                &client_dir.join(&file),
                &render::render_client_config(client, group),
            )
            .await?;
            expected.push(file);
        }
        prune_stale(&client_dir, &expected).await?;

        debug!(path = %path.display(), clients = active.len(), "wrote interface config");

        if group.is_running {
            self.reload(group).await?;
        }
        Ok(())
    }

    /// Bring the interface up from its config file.
    #[tracing::instrument(skip(self, group), fields(interface = %group.interface_name))]
    pub async fn start(&self, group: &Group) -> Result<()> {
        let path = self.config_path(group);
        let path = path.to_string_lossy();
        self.runner.run("wg-quick", &["up", &path], None).await?;
        info!("interface up");
        Ok(())
    }

    /// Tear the interface down. Stopping an interface that is already down
    /// is not an error; wg-quick's complaint about it is swallowed so stop
    /// stays idempotent.
    #[tracing::instrument(skip(self, group), fields(interface = %group.interface_name))]
    pub async fn stop(&self, group: &Group) -> Result<()> {
        let path = self.config_path(group);
        let path = path.to_string_lossy();
        match self.runner.run("wg-quick", &["down", &path], None).await {
            Ok(_) => {
                info!("interface down");
                Ok(())
            }
            Err(WgError::Tool { detail, .. })
                if detail.contains("is not a WireGuard interface") =>
            {
                debug!("interface was already down");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Restart the interface so it picks up a changed config. wg-quick has
    /// no true reload, so this is a stop followed by a start.
    pub async fn reload(&self, group: &Group) -> Result<()> {
        self.stop(group).await?;
        self.start(group).await
    }

    /// Remove all on-disk state for a group. The interface is stopped
    /// best-effort first; a failure there must not strand the files.
    #[tracing::instrument(skip(self, group), fields(interface = %group.interface_name))]
    pub async fn delete(&self, group: &Group) -> Result<()> {
        if let Err(e) = self.stop(group).await {
            warn!(error = %e, "could not stop interface before delete, removing config anyway");
        }
        remove_file_if_exists(&self.config_path(group)).await?;
        let dir = self.client_config_dir(group);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

async fn write_restricted(path: &Path, contents: &str) -> Result<()> {
    tokio::fs::write(path, contents).await?;
    // configs hold private keys
    #[cfg(unix)]
    {
        use std::fs::Permissions;
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

async fn remove_file_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Delete `.conf` files in `dir` that are not in `expected`.
async fn prune_stale(dir: &Path, expected: &[String]) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.ends_with(".conf") && !expected.iter().any(|f| f == name) {
            debug!(file = name, "pruning stale client config");
            remove_file_if_exists(&entry.path()).await?;
        }
    }
    Ok(())
}
