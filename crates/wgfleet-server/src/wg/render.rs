//! Deterministic wg-quick config rendering. Output depends only on the
//! group and client rows, so writing a config twice produces identical
//! bytes and reloads can be skipped when nothing changed.

use std::fmt::Write;

use crate::db::client::Client;
use crate::db::group::Group;

/// iptables rules applied around interface lifetime. `flag` is `'A'` for
/// PostUp and `'D'` for PostDown.
fn nat_rules(group: &Group, flag: char) -> Vec<String> {
    let mut rules = vec![
        format!("iptables -{flag} FORWARD -i %i -j ACCEPT"),
        format!("iptables -{flag} FORWARD -o %i -j ACCEPT"),
        format!(
            "iptables -t nat -{flag} POSTROUTING -s {} -j MASQUERADE",
            group.ip_range
        ),
    ];
    if let Some(range_v6) = group.ip_range_v6 {
        rules.push(format!("ip6tables -{flag} FORWARD -i %i -j ACCEPT"));
        rules.push(format!("ip6tables -{flag} FORWARD -o %i -j ACCEPT"));
        rules.push(format!(
            "ip6tables -t nat -{flag} POSTROUTING -s {range_v6} -j MASQUERADE"
        ));
    }
    rules
}

/// The interface config written to `<config_root>/<interface_name>.conf`.
/// Peers are the active clients in ascending id order; inactive clients are
/// simply absent.
pub fn render_server_config(group: &Group, active_clients: &[Client]) -> String {
    let mut config = String::new();
    writeln!(config, "[Interface]").unwrap();
    writeln!(config, "PrivateKey = {}", group.server_private_key).unwrap();
    write!(config, "Address = {}/{}", group.server_ip.ip(), group.ip_range.prefix()).unwrap();
    if let (Some(server_ip_v6), Some(range_v6)) = (group.server_ip_v6, group.ip_range_v6) {
        write!(config, ", {}/{}", server_ip_v6.ip(), range_v6.prefix()).unwrap();
    }
    writeln!(config).unwrap();
    writeln!(config, "ListenPort = {}", group.listen_port).unwrap();
    writeln!(config, "PostUp = {}", nat_rules(group, 'A').join("; ")).unwrap();
    writeln!(config, "PostDown = {}", nat_rules(group, 'D').join("; ")).unwrap();

    for client in active_clients {
        writeln!(config).unwrap();
        writeln!(config, "# {}", client.name).unwrap();
        writeln!(config, "[Peer]").unwrap();
        writeln!(config, "PublicKey = {}", client.public_key).unwrap();
        write!(config, "AllowedIPs = {}/32", client.assigned_ip.ip()).unwrap();
        if let Some(ip_v6) = client.assigned_ip_v6 {
            write!(config, ", {}/128", ip_v6.ip()).unwrap();
        }
        writeln!(config).unwrap();
        if let Some(psk) = &client.preshared_key {
            writeln!(config, "PresharedKey = {psk}").unwrap();
        }
    }

    config
}

/// What goes into the client's AllowedIPs line. Clients permitted to reach
/// their peers get their own routes verbatim; a `0.0.0.0/0` there widens to
/// a full dual-stack tunnel. Everyone else is confined to the group subnet.
fn client_allowed_ips(client: &Client, group: &Group) -> String {
    if client.can_address_peers && group.allow_client_to_client {
        return client.allowed_ips.clone();
    }
    if client
        .allowed_ips
        .split(',')
        .any(|part| part.trim() == "0.0.0.0/0")
    {
        return "0.0.0.0/0, ::/0".to_string();
    }
    let mut routes = group.ip_range.to_string();
    if let Some(range_v6) = group.ip_range_v6 {
        write!(routes, ", {range_v6}").unwrap();
    }
    routes
}

/// A complete config the end user can import directly into their WireGuard
/// client.
pub fn render_client_config(client: &Client, group: &Group) -> String {
    let mut config = String::new();
    writeln!(config, "[Interface]").unwrap();
    writeln!(config, "PrivateKey = {}", client.private_key).unwrap();
    write!(config, "Address = {}/32", client.assigned_ip.ip()).unwrap();
    if let Some(ip_v6) = client.assigned_ip_v6 {
        write!(config, ", {}/128", ip_v6.ip()).unwrap();
    }
    writeln!(config).unwrap();
    let dns = client.dns_override.as_deref().unwrap_or(&group.dns);
    if !dns.is_empty() {
        writeln!(config, "DNS = {dns}").unwrap();
    }
    if group.mtu > 0 {
        writeln!(config, "MTU = {}", group.mtu).unwrap();
    }

    writeln!(config).unwrap();
    writeln!(config, "[Peer]").unwrap();
    writeln!(config, "PublicKey = {}", group.server_public_key).unwrap();
    if let Some(psk) = &client.preshared_key {
        writeln!(config, "PresharedKey = {psk}").unwrap();
    }
    writeln!(config, "AllowedIPs = {}", client_allowed_ips(client, group)).unwrap();
    if !group.endpoint.is_empty() {
        writeln!(config, "Endpoint = {}:{}", group.endpoint, group.listen_port).unwrap();
    }
    if group.persistent_keepalive > 0 {
        writeln!(config, "PersistentKeepalive = {}", group.persistent_keepalive).unwrap();
    }

    config
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use ipnetwork::IpNetwork;

    use super::*;

    fn make_group() -> Group {
        Group {
            id: 1,
            name: "office".to_string(),
            description: String::new(),
            interface_name: "wg-office".to_string(),
            server_private_key: "SERVER_PRIV".to_string(),
            server_public_key: "SERVER_PUB".to_string(),
            ip_range: "10.0.0.0/24".parse().unwrap(),
            server_ip: "10.0.0.1/32".parse().unwrap(),
            ip_range_v6: None,
            server_ip_v6: None,
            listen_port: 51821,
            dns: "1.1.1.1, 8.8.8.8".to_string(),
            endpoint: "vpn.example.com".to_string(),
            persistent_keepalive: 25,
            mtu: 1420,
            allow_client_to_client: false,
            is_running: false,
            owner_id: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn make_client(id: i64, ip: &str) -> Client {
        Client {
            id,
            group_id: 1,
            name: format!("client{id}"),
            description: String::new(),
            private_key: format!("PRIV{id}"),
            public_key: format!("PUB{id}"),
            preshared_key: None,
            assigned_ip: ip.parse().unwrap(),
            assigned_ip_v6: None,
            allowed_ips: "0.0.0.0/0".to_string(),
            can_address_peers: false,
            dns_override: None,
            is_active: true,
            expires_at: None,
            last_handshake: None,
            total_received: 0,
            total_sent: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn server_config_shape() {
        let group = make_group();
        let clients = vec![make_client(1, "10.0.0.2/32"), make_client(2, "10.0.0.3/32")];
        let config = render_server_config(&group, &clients);

        assert!(config.starts_with("[Interface]\n"));
        assert!(config.contains("PrivateKey = SERVER_PRIV\n"));
        assert!(config.contains("Address = 10.0.0.1/24\n"));
        assert!(config.contains("ListenPort = 51821\n"));
        assert!(config.contains(
            "PostUp = iptables -A FORWARD -i %i -j ACCEPT; \
             iptables -A FORWARD -o %i -j ACCEPT; \
             iptables -t nat -A POSTROUTING -s 10.0.0.0/24 -j MASQUERADE\n"
        ));
        assert!(config.contains("PostDown = iptables -D FORWARD"));
        assert_eq!(config.matches("[Interface]").count(), 1);
        assert_eq!(config.matches("[Peer]").count(), 2);
        assert!(config.contains("# client1\n[Peer]\nPublicKey = PUB1\nAllowedIPs = 10.0.0.2/32\n"));
        // peer order follows client id order
        let first = config.find("PUB1").unwrap();
        let second = config.find("PUB2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn server_config_is_deterministic() {
        let group = make_group();
        let clients = vec![make_client(1, "10.0.0.2/32")];
        assert_eq!(
            render_server_config(&group, &clients),
            render_server_config(&group, &clients)
        );
    }

    #[test]
    fn server_config_dual_stack() {
        let mut group = make_group();
        group.ip_range_v6 = Some("fd00::/64".parse().unwrap());
        group.server_ip_v6 = Some("fd00::1/128".parse().unwrap());
        let mut client = make_client(1, "10.0.0.2/32");
        client.assigned_ip_v6 = Some("fd00::2/128".parse().unwrap());

        let config = render_server_config(&group, &[client]);
        assert!(config.contains("Address = 10.0.0.1/24, fd00::1/64\n"));
        assert!(config.contains("ip6tables -t nat -A POSTROUTING -s fd00::/64 -j MASQUERADE"));
        assert!(config.contains("AllowedIPs = 10.0.0.2/32, fd00::2/128\n"));
    }

    #[test]
    fn server_config_includes_preshared_key() {
        let group = make_group();
        let mut client = make_client(1, "10.0.0.2/32");
        client.preshared_key = Some("PSK1".to_string());
        let config = render_server_config(&group, &[client]);
        assert!(config.contains("PresharedKey = PSK1\n"));
    }

    #[test]
    fn client_config_full_tunnel_override() {
        let group = make_group();
        let client = make_client(1, "10.0.0.2/32");
        let config = render_client_config(&client, &group);

        assert!(config.contains("PrivateKey = PRIV1\n"));
        assert!(config.contains("Address = 10.0.0.2/32\n"));
        assert!(config.contains("DNS = 1.1.1.1, 8.8.8.8\n"));
        assert!(config.contains("MTU = 1420\n"));
        assert!(config.contains("PublicKey = SERVER_PUB\n"));
        // 0.0.0.0/0 widens to dual-stack full tunnel even without peer access
        assert!(config.contains("AllowedIPs = 0.0.0.0/0, ::/0\n"));
        assert!(config.contains("Endpoint = vpn.example.com:51821\n"));
        assert!(config.contains("PersistentKeepalive = 25\n"));
    }

    #[test]
    fn client_config_restricted_to_group_subnet() {
        let group = make_group();
        let mut client = make_client(1, "10.0.0.2/32");
        client.allowed_ips = "192.168.0.0/16".to_string();
        let config = render_client_config(&client, &group);
        assert!(config.contains("AllowedIPs = 10.0.0.0/24\n"));
    }

    #[test]
    fn client_config_peer_routes_when_allowed() {
        let mut group = make_group();
        group.allow_client_to_client = true;
        let mut client = make_client(1, "10.0.0.2/32");
        client.can_address_peers = true;
        client.allowed_ips = "10.0.0.0/24, 192.168.0.0/16".to_string();
        let config = render_client_config(&client, &group);
        assert!(config.contains("AllowedIPs = 10.0.0.0/24, 192.168.0.0/16\n"));
    }

    #[test]
    fn client_config_dns_override_and_omissions() {
        let mut group = make_group();
        group.endpoint = String::new();
        group.persistent_keepalive = 0;
        group.mtu = 0;
        let mut client = make_client(1, "10.0.0.2/32");
        client.dns_override = Some("9.9.9.9".to_string());
        let config = render_client_config(&client, &group);

        assert!(config.contains("DNS = 9.9.9.9\n"));
        assert!(!config.contains("Endpoint"));
        assert!(!config.contains("PersistentKeepalive"));
        assert!(!config.contains("MTU"));
    }
}
