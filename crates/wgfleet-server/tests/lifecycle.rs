use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tempfile::TempDir;

use wgfleet_server::db::client::Client;
use wgfleet_server::db::group::Group;
use wgfleet_server::wg::interface::InterfaceManager;
use wgfleet_server::wg::keys::KeyGenerator;
use wgfleet_server::wg::{WgError, WgRunner, stats};

// -- Mock runner that records calls and plays back scripted responses --

#[derive(Debug, Clone)]
struct MockRunner {
    calls: Arc<Mutex<Vec<String>>>,
    responses: Arc<Mutex<Vec<Result<String, WgError>>>>,
}

impl MockRunner {
    fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            responses: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push_response(&self, response: Result<String, WgError>) {
        self.responses.lock().unwrap().push(response);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl WgRunner for MockRunner {
    async fn run(
        &self,
        program: &'static str,
        args: &[&str],
        _stdin: Option<&str>,
    ) -> Result<String, WgError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok(String::new())
        } else {
            responses.remove(0)
        }
    }
}

// -- Helpers --

fn make_group() -> Group {
    Group {
        id: 7,
        name: "office".into(),
        description: String::new(),
        interface_name: "wg-office".into(),
        server_private_key: "SERVER_PRIV".into(),
        server_public_key: "SERVER_PUB".into(),
        ip_range: "10.10.0.0/24".parse().unwrap(),
        server_ip: "10.10.0.1/32".parse().unwrap(),
        ip_range_v6: None,
        server_ip_v6: None,
        listen_port: 51827,
        dns: "1.1.1.1".into(),
        endpoint: "vpn.example.com".into(),
        persistent_keepalive: 25,
        mtu: 1420,
        allow_client_to_client: false,
        is_running: false,
        owner_id: 1,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn make_client(id: i64, name: &str, active: bool) -> Client {
    Client {
        id,
        group_id: 7,
        name: name.into(),
        description: String::new(),
        private_key: format!("PRIV{id}"),
        public_key: format!("PUB{id}"),
        preshared_key: None,
        assigned_ip: format!("10.10.0.{}/32", id + 1).parse().unwrap(),
        assigned_ip_v6: None,
        allowed_ips: "0.0.0.0/0".into(),
        can_address_peers: false,
        dns_override: None,
        is_active: active,
        expires_at: None,
        last_handshake: None,
        total_received: 0,
        total_sent: 0,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// -- Config file lifecycle --

#[tokio::test]
async fn save_config_writes_interface_and_client_files() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let manager = InterfaceManager::new(root.path(), runner.clone());
    let group = make_group();
    let clients = vec![make_client(1, "alice", true), make_client(2, "bob", false)];

    manager.save_config(&group, &clients).await.unwrap();

    let conf = std::fs::read_to_string(root.path().join("wg-office.conf")).unwrap();
    // only the active client appears as a peer
    assert!(conf.contains("PublicKey = PUB1"));
    assert!(!conf.contains("PublicKey = PUB2"));

    // only active clients get an exported config
    assert!(root.path().join("wg-office/alice-1.conf").exists());
    assert!(!root.path().join("wg-office/bob-2.conf").exists());

    // group not running, so no wg-quick invocations
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn save_config_restricts_permissions() {
    let root = TempDir::new().unwrap();
    let manager = InterfaceManager::new(root.path(), MockRunner::new());
    let group = make_group();

    manager
        .save_config(&group, &[make_client(1, "alice", true)])
        .await
        .unwrap();

    for path in [
        root.path().join("wg-office.conf"),
        root.path().join("wg-office/alice-1.conf"),
    ] {
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600, "{}", path.display());
    }
}

#[tokio::test]
async fn save_config_prunes_removed_client_configs() {
    let root = TempDir::new().unwrap();
    let manager = InterfaceManager::new(root.path(), MockRunner::new());
    let group = make_group();

    manager
        .save_config(&group, &[make_client(1, "alice", true), make_client(2, "bob", true)])
        .await
        .unwrap();
    assert!(root.path().join("wg-office/bob-2.conf").exists());

    manager
        .save_config(&group, &[make_client(1, "alice", true)])
        .await
        .unwrap();
    assert!(root.path().join("wg-office/alice-1.conf").exists());
    assert!(!root.path().join("wg-office/bob-2.conf").exists());
}

#[tokio::test]
async fn save_config_prunes_deactivated_client_configs() {
    let root = TempDir::new().unwrap();
    let manager = InterfaceManager::new(root.path(), MockRunner::new());
    let group = make_group();

    manager
        .save_config(&group, &[make_client(2, "bob", true)])
        .await
        .unwrap();
    assert!(root.path().join("wg-office/bob-2.conf").exists());

    // still in the database, but deactivated: the export goes away
    manager
        .save_config(&group, &[make_client(2, "bob", false)])
        .await
        .unwrap();
    assert!(!root.path().join("wg-office/bob-2.conf").exists());
}

#[tokio::test]
async fn save_config_reloads_running_interface() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let manager = InterfaceManager::new(root.path(), runner.clone());
    let mut group = make_group();
    group.is_running = true;

    manager.save_config(&group, &[]).await.unwrap();

    let calls = runner.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].starts_with("wg-quick down "));
    assert!(calls[1].starts_with("wg-quick up "));
}

// -- Start/stop --

#[tokio::test]
async fn stop_is_idempotent_when_interface_already_down() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    runner.push_response(Err(WgError::Tool {
        program: "wg-quick",
        detail: "[#] ip link delete dev wg-office\nwg-office is not a WireGuard interface".into(),
    }));
    let manager = InterfaceManager::new(root.path(), runner.clone());
    let group = make_group();

    manager.stop(&group).await.unwrap();
}

#[tokio::test]
async fn stop_surfaces_other_tool_failures() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    runner.push_response(Err(WgError::Tool {
        program: "wg-quick",
        detail: "Permission denied".into(),
    }));
    let manager = InterfaceManager::new(root.path(), runner.clone());
    let group = make_group();

    assert!(matches!(
        manager.stop(&group).await,
        Err(WgError::Tool { .. })
    ));
}

#[tokio::test]
async fn delete_removes_config_and_client_dir() {
    let root = TempDir::new().unwrap();
    let runner = MockRunner::new();
    let manager = InterfaceManager::new(root.path(), runner.clone());
    let group = make_group();

    manager
        .save_config(&group, &[make_client(1, "alice", true)])
        .await
        .unwrap();
    manager.delete(&group).await.unwrap();

    assert!(!root.path().join("wg-office.conf").exists());
    assert!(!root.path().join("wg-office").exists());
    // teardown was attempted first
    assert!(runner.calls().iter().any(|c| c.starts_with("wg-quick down")));
}

#[tokio::test]
async fn delete_tolerates_missing_files() {
    let root = TempDir::new().unwrap();
    let manager = InterfaceManager::new(root.path(), MockRunner::new());
    let group = make_group();

    // nothing was ever written for this group
    manager.delete(&group).await.unwrap();
}

// -- Key generation through the runner --

#[tokio::test]
async fn keypair_uses_tool_output_when_available() {
    let runner = MockRunner::new();
    runner.push_response(Ok("TOOL_PRIVATE_KEY".into()));
    runner.push_response(Ok("TOOL_PUBLIC_KEY".into()));
    let keygen = KeyGenerator::new(runner.clone());

    let keypair = keygen.generate_keypair().await;
    assert_eq!(keypair.private_key, "TOOL_PRIVATE_KEY");
    assert_eq!(keypair.public_key, "TOOL_PUBLIC_KEY");
    assert_eq!(runner.calls(), vec!["wg genkey", "wg pubkey"]);
}

#[tokio::test]
async fn keypair_falls_back_when_tool_is_missing() {
    let runner = MockRunner::new();
    runner.push_response(Err(WgError::Spawn {
        program: "wg",
        source: std::io::Error::from(std::io::ErrorKind::NotFound),
    }));
    let keygen = KeyGenerator::new(runner);

    let keypair = keygen.generate_keypair().await;
    // fallback produces a real base64 x25519 pair
    assert_eq!(keypair.private_key.len(), 44);
    assert_eq!(keypair.public_key.len(), 44);
    assert_ne!(keypair.private_key, keypair.public_key);
}

// -- Stats collection over the runner --

#[tokio::test]
async fn collect_polls_the_right_interface() {
    let runner = MockRunner::new();
    runner.push_response(Ok(
        "PRIV\tPUB\t51827\toff\n\
         PUB1\t(none)\t198.51.100.7:40001\t10.10.0.2/32\t1700000000\t500\t250\t25"
            .into(),
    ));

    let peers = stats::collect(&runner, "wg-office").await.unwrap();
    assert_eq!(runner.calls(), vec!["wg show wg-office dump"]);
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].public_key, "PUB1");

    let mut clients = vec![make_client(1, "alice", true), make_client(2, "bob", true)];
    let updated = stats::merge_into(&mut clients, &peers);
    assert_eq!(updated, vec![1]);
    assert_eq!(clients[0].total_received, 500);
    assert_eq!(clients[0].total_sent, 250);
    assert_eq!(clients[0].last_handshake.map(|t| t.timestamp()), Some(1700000000));
    assert_eq!(clients[1].last_handshake, None);
}
