//! Parsing of `wg show <interface> dump` output. The dump is tab separated:
//! one four-field line for the interface itself, then one eight-field line
//! per peer. Counters are absolute for the lifetime of the interface and a
//! handshake epoch of zero means the peer has never connected.

use chrono::{DateTime, Utc};

use crate::db::client::Client;

use super::{Result, WgRunner};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStats {
    pub public_key: String,
    pub endpoint: Option<String>,
    pub latest_handshake: i64,
    pub received: i64,
    pub sent: i64,
}

/// Parse a full dump, skipping the interface header and any line that does
/// not parse cleanly. A flapping peer line should never poison the rest of
/// the poll.
pub fn parse_dump(output: &str) -> Vec<PeerStats> {
    output.lines().filter_map(parse_peer_line).collect()
}

fn parse_peer_line(line: &str) -> Option<PeerStats> {
    let fields: Vec<&str> = line.split('\t').collect();
    // peer lines: pubkey, psk, endpoint, allowed-ips, handshake, rx, tx, keepalive
    if fields.len() < 8 {
        return None;
    }
    let endpoint = match fields[2] {
        "(none)" => None,
        other => Some(other.to_string()),
    };
    Some(PeerStats {
        public_key: fields[0].to_string(),
        endpoint,
        latest_handshake: fields[4].parse().ok()?,
        received: fields[5].parse().ok()?,
        sent: fields[6].parse().ok()?,
    })
}

/// Poll live counters for one interface.
pub async fn collect<R: WgRunner>(runner: &R, interface: &str) -> Result<Vec<PeerStats>> {
    let output = runner.run("wg", &["show", interface, "dump"], None).await?;
    Ok(parse_dump(&output))
}

/// Fold polled stats into the matching client rows, keyed by public key.
/// Returns the ids of the clients that were updated. Clients without a
/// matching peer (and peers without a matching client) are left alone.
pub fn merge_into(clients: &mut [Client], stats: &[PeerStats]) -> Vec<i64> {
    let mut updated = Vec::new();
    for client in clients.iter_mut() {
        let Some(peer) = stats.iter().find(|s| s.public_key == client.public_key) else {
            continue;
        };
        client.last_handshake = (peer.latest_handshake > 0)
            .then(|| DateTime::<Utc>::from_timestamp(peer.latest_handshake, 0))
            .flatten();
        client.total_received = peer.received;
        client.total_sent = peer.sent;
        updated.push(client.id);
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUMP: &str = "PRIVKEY\tPUBKEY\t51820\toff\n\
        peerA\t(none)\t203.0.113.5:41000\t10.0.0.2/32\t1700000000\t500\t250\t25\n\
        peerB\t(none)\t(none)\t10.0.0.3/32\t0\t0\t0\toff\n";

    #[test]
    fn parses_peers_and_skips_interface_header() {
        let stats = parse_dump(DUMP);
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats[0],
            PeerStats {
                public_key: "peerA".to_string(),
                endpoint: Some("203.0.113.5:41000".to_string()),
                latest_handshake: 1700000000,
                received: 500,
                sent: 250,
            }
        );
        assert_eq!(stats[1].endpoint, None);
        assert_eq!(stats[1].latest_handshake, 0);
    }

    #[test]
    fn skips_malformed_lines() {
        let dump = "garbage line\n\
            peerA\t(none)\t(none)\t10.0.0.2/32\tnot-a-number\t1\t2\toff\n\
            peerB\t(none)\t(none)\t10.0.0.3/32\t1700000001\t10\t20\toff\n";
        let stats = parse_dump(dump);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].public_key, "peerB");
    }

    #[test]
    fn empty_dump_yields_no_peers() {
        assert!(parse_dump("PRIVKEY\tPUBKEY\t51820\toff\n").is_empty());
        assert!(parse_dump("").is_empty());
    }

    #[test]
    fn merge_updates_matching_clients_only() {
        let mut clients = vec![
            make_client(1, "peerA"),
            make_client(2, "peerB"),
            make_client(3, "peerC"),
        ];
        let stats = parse_dump(DUMP);
        let updated = merge_into(&mut clients, &stats);

        assert_eq!(updated, vec![1, 2]);
        assert_eq!(clients[0].total_received, 500);
        assert_eq!(clients[0].total_sent, 250);
        assert_eq!(
            clients[0].last_handshake.map(|t| t.timestamp()),
            Some(1700000000)
        );
        // zero epoch means never connected
        assert_eq!(clients[1].last_handshake, None);
        // no peer line for this client, so it keeps its previous values
        assert_eq!(clients[2].total_received, 0);
        assert_eq!(clients[2].last_handshake, None);
    }

    fn make_client(id: i64, public_key: &str) -> Client {
        use chrono::Utc;
        Client {
            id,
            group_id: 1,
            name: format!("client{id}"),
            description: String::new(),
            private_key: String::new(),
            public_key: public_key.to_string(),
            preshared_key: None,
            assigned_ip: "10.0.0.2/32".parse().unwrap(),
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
}
