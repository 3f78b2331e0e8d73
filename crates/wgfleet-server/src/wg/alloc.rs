//! Next-free-address computation within a group's CIDR ranges.
//!
//! Linear scan in ascending numeric order, skipping the server address and
//! every address already handed to a client (active or not). Host ranges are
//! administrator-sized and allocation is not a hot path, so O(range) is fine;
//! the IPv6 variant is windowed so a /64 cannot make us walk 2^64 addresses.

use std::collections::HashSet;
use std::net::{Ipv4Addr, Ipv6Addr};

use ipnetwork::{Ipv4Network, Ipv6Network};

/// How many host addresses the IPv6 allocator inspects before giving up.
const V6_SCAN_WINDOW: u128 = 1000;

/// First usable host address of an IPv4 network (the server's address).
pub fn first_host_v4(range: Ipv4Network) -> Ipv4Addr {
    let base = u32::from(range.network());
    if range.prefix() >= 31 {
        Ipv4Addr::from(base)
    } else {
        Ipv4Addr::from(base + 1)
    }
}

/// First usable host address of an IPv6 network.
pub fn first_host_v6(range: Ipv6Network) -> Ipv6Addr {
    let base = u128::from(range.network());
    if range.prefix() >= 127 {
        Ipv6Addr::from(base)
    } else {
        Ipv6Addr::from(base + 1)
    }
}

/// Inclusive bounds of the usable host addresses in `range`.
///
/// Mirrors the usual host enumeration rules: the network and broadcast
/// addresses are excluded for prefixes shorter than /31, while /31 and /32
/// treat every address as a host.
fn host_bounds_v4(range: Ipv4Network) -> (u32, u32) {
    let network = u32::from(range.network());
    let broadcast = u32::from(range.broadcast());
    if range.prefix() >= 31 {
        (network, broadcast)
    } else {
        (network + 1, broadcast - 1)
    }
}

/// Next unassigned IPv4 host address, or `None` when the range is exhausted.
pub fn next_available_ipv4(
    range: Ipv4Network,
    server_ip: Ipv4Addr,
    used: &HashSet<Ipv4Addr>,
) -> Option<Ipv4Addr> {
    let (first, last) = host_bounds_v4(range);
    (first..=last)
        .map(Ipv4Addr::from)
        .find(|ip| *ip != server_ip && !used.contains(ip))
}

/// Next unassigned IPv6 host address within the scan window.
///
/// Returns `None` once the window (or the range itself) is exhausted, even
/// if free addresses exist further up the range.
pub fn next_available_ipv6(
    range: Ipv6Network,
    server_ip: Ipv6Addr,
    used: &HashSet<Ipv6Addr>,
) -> Option<Ipv6Addr> {
    let first = u128::from(first_host_v6(range));
    (0..V6_SCAN_WINDOW)
        .map_while(|offset| first.checked_add(offset))
        .map(Ipv6Addr::from)
        .take_while(|ip| range.contains(*ip))
        .find(|ip| *ip != server_ip && !used.contains(ip))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    fn v6(s: &str) -> Ipv6Network {
        s.parse().unwrap()
    }

    #[test]
    fn first_host_is_network_plus_one() {
        assert_eq!(first_host_v4(v4("10.0.0.0/24")), "10.0.0.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(first_host_v4(v4("192.168.4.128/25")), "192.168.4.129".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn sequential_allocations_are_distinct_and_in_range() {
        let range = v4("10.0.0.0/24");
        let server = first_host_v4(range);
        let mut used = HashSet::new();

        for _ in 0..20 {
            let ip = next_available_ipv4(range, server, &used).unwrap();
            assert!(range.contains(ip));
            assert_ne!(ip, server);
            assert!(used.insert(ip), "allocator returned {ip} twice");
        }
    }

    #[test]
    fn skips_already_assigned_addresses() {
        let range = v4("10.0.0.0/24");
        let server = first_host_v4(range);
        let used: HashSet<Ipv4Addr> =
            ["10.0.0.2", "10.0.0.3"].iter().map(|s| s.parse().unwrap()).collect();

        let ip = next_available_ipv4(range, server, &used).unwrap();
        assert_eq!(ip, "10.0.0.4".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn slash_28_exhausts_after_thirteen_clients() {
        // 14 usable hosts, one consumed by the server.
        let range = v4("10.15.0.0/28");
        let server = first_host_v4(range);
        let mut used = HashSet::new();

        for _ in 0..13 {
            let ip = next_available_ipv4(range, server, &used).unwrap();
            used.insert(ip);
        }
        assert_eq!(next_available_ipv4(range, server, &used), None);
    }

    #[test]
    fn slash_30_has_one_client_slot() {
        let range = v4("10.0.0.0/30");
        let server = first_host_v4(range);
        let mut used = HashSet::new();

        let ip = next_available_ipv4(range, server, &used).unwrap();
        assert_eq!(ip, "10.0.0.2".parse::<Ipv4Addr>().unwrap());
        used.insert(ip);
        assert_eq!(next_available_ipv4(range, server, &used), None);
    }

    #[test]
    fn ipv6_allocates_sequentially() {
        let range = v6("fd00::/64");
        let server = first_host_v6(range);
        let mut used = HashSet::new();

        let first = next_available_ipv6(range, server, &used).unwrap();
        assert_eq!(first, "fd00::2".parse::<Ipv6Addr>().unwrap());
        used.insert(first);

        let second = next_available_ipv6(range, server, &used).unwrap();
        assert_eq!(second, "fd00::3".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn ipv6_scan_window_bounds_the_search() {
        let range = v6("fd00::/64");
        let server = first_host_v6(range);
        let first = u128::from(first_host_v6(range));

        // Fill the whole window.
        let used: HashSet<Ipv6Addr> = (0..1000).map(|i| Ipv6Addr::from(first + i)).collect();
        assert_eq!(next_available_ipv6(range, server, &used), None);
    }

    #[test]
    fn ipv6_respects_small_ranges() {
        // /126 has two usable hosts beyond the anycast address; one is the server.
        let range = v6("fd00::/126");
        let server = first_host_v6(range);
        let mut used = HashSet::new();

        let ip = next_available_ipv6(range, server, &used).unwrap();
        used.insert(ip);
        let ip = next_available_ipv6(range, server, &used).unwrap();
        used.insert(ip);
        assert_eq!(next_available_ipv6(range, server, &used), None);
    }
}
