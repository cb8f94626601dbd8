//! Hostname resolution helper for turning `(host, port)` pairs into the
//! `SocketAddr`s that [`crate::client::Client::try_register_endpoint`] expects.
//!
//! Adapted from the teacher's `dns::resolve_hostports` (itself already
//! protocol-agnostic — it operated on plain `(String, u16)` tuples, not
//! Kudu's `HostPortPB`). The companion `resolve_hosts` (took Kudu's
//! protobuf-generated `HostPortPB`) and `is_local_addr`/`LOCAL_ADDRS` (local
//! network interface enumeration, used only for Kudu master leader-affinity
//! heuristics) have no counterpart in a protocol-agnostic core and were
//! dropped rather than carried forward.

use std::cmp::Ordering;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolves each `(host, port)` pair via the system resolver, logging and
/// skipping any hostname that fails to resolve rather than failing the whole
/// batch. The result is sorted and deduplicated.
pub fn resolve_hostports(hostports: &[(String, u16)]) -> Vec<SocketAddr> {
    let mut addrs = Vec::new();
    for (host, port) in hostports {
        match (host.as_str(), *port).to_socket_addrs() {
            Ok(resolved) => addrs.extend(resolved),
            Err(error) => log::warn!("unable to resolve hostname {host:?}: {error}"),
        }
    }
    addrs.sort_by(cmp_socket_addrs);
    addrs.dedup();
    addrs
}

fn cmp_socket_addrs(a: &SocketAddr, b: &SocketAddr) -> Ordering {
    match (a, b) {
        (SocketAddr::V4(a), SocketAddr::V4(b)) => (a.ip(), a.port()).cmp(&(b.ip(), b.port())),
        (SocketAddr::V6(a), SocketAddr::V6(b)) => (a.ip(), a.port()).cmp(&(b.ip(), b.port())),
        (SocketAddr::V4(_), SocketAddr::V6(_)) => Ordering::Less,
        (SocketAddr::V6(_), SocketAddr::V4(_)) => Ordering::Greater,
    }
}
