//! Resolve the uid owning a local socket from the `/proc/net` socket tables.

use crate::error::SessionError;
use crate::rpc::{ConnectionQuery, IpProtocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEntry {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub uid: u32,
}

/// Parses one `/proc/net/{tcp,tcp6,udp,udp6}` table. Malformed rows are skipped.
pub fn parse_socket_table(content: &str) -> Vec<SocketEntry> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            Some(SocketEntry {
                local: parse_hex_socket(fields.get(1)?)?,
                remote: parse_hex_socket(fields.get(2)?)?,
                uid: fields.get(7)?.parse().ok()?,
            })
        })
        .collect()
}

/// `0100007F:1F90` style address. IPv4 is one little-endian word; IPv6 is four.
fn parse_hex_socket(field: &str) -> Option<SocketAddr> {
    let (addr, port) = field.split_once(':')?;
    let port = u16::from_str_radix(port, 16).ok()?;
    let ip = match addr.len() {
        8 => IpAddr::V4(Ipv4Addr::from(u32::from_str_radix(addr, 16).ok()?.swap_bytes())),
        32 => {
            let mut octets = [0u8; 16];
            for (word_index, chunk) in octets.chunks_mut(4).enumerate() {
                let start = word_index * 8;
                let word = u32::from_str_radix(addr.get(start..start + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.to_le_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

fn same_endpoint(table: SocketAddr, wanted: SocketAddr, allow_unspecified: bool) -> bool {
    if table.port() != wanted.port() {
        return false;
    }
    let table_ip = table.ip().to_canonical();
    table_ip == wanted.ip().to_canonical() || (allow_unspecified && table_ip.is_unspecified())
}

/// Exact match on both ends first; for UDP an unconnected or wildcard-bound
/// socket on the source port also matches.
pub fn find_owner(entries: &[SocketEntry], query: &ConnectionQuery) -> Option<u32> {
    let exact = entries.iter().find(|entry| {
        same_endpoint(entry.local, query.source, false)
            && same_endpoint(entry.remote, query.destination, false)
    });
    if let Some(entry) = exact {
        return Some(entry.uid);
    }
    if query.protocol == IpProtocol::Udp {
        return entries
            .iter()
            .find(|entry| {
                same_endpoint(entry.local, query.source, true) && entry.remote.ip().is_unspecified()
            })
            .map(|entry| entry.uid);
    }
    None
}

pub fn find_connection_owner(query: &ConnectionQuery) -> Result<u32, SessionError> {
    let tables: &[&str] = match query.protocol {
        IpProtocol::Tcp => &["/proc/net/tcp", "/proc/net/tcp6"],
        IpProtocol::Udp => &["/proc/net/udp", "/proc/net/udp6"],
    };
    let mut entries = Vec::new();
    for table in tables {
        match std::fs::read_to_string(table) {
            Ok(content) => entries.extend(parse_socket_table(&content)),
            Err(e) => tracing::debug!("Skipping socket table {}: {}", table, e),
        }
    }
    find_owner(&entries, query).ok_or_else(|| {
        SessionError::ConnectionOwnerLookupFailed(format!(
            "no {:?} socket {} -> {}",
            query.protocol, query.source, query.destination
        ))
    })
}

#[cfg(test)]
#[path = "tests/owner_tests.rs"]
mod tests;
