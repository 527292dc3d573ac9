//! Persisted node state.
//!
//! Bencoded dictionary:
//!
//! | Key | Value |
//! |-----|-------|
//! | `node-id` | list of IDs; 20 bytes (legacy) or address + ID (24 / 36 bytes) |
//! | `nodes` | list of 6-byte compact IPv4 endpoints |
//! | `nodes6` | list of 18-byte compact IPv6 endpoints |

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::msg::{bytes, compact_endpoint, decode_dict, encode_dict, read_endpoint, Dict, DictExt, Value};
use crate::node_id::{NodeId, ID_LEN};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DhtState {
    /// Node IDs, each tied to the interface address it was generated for.
    /// `None` is a legacy entry valid for any interface.
    pub node_ids: Vec<(Option<IpAddr>, NodeId)>,
    pub nodes: Vec<SocketAddr>,
    pub nodes6: Vec<SocketAddr>,
}

impl DhtState {
    /// ID saved for `addr`, falling back to a legacy entry.
    pub fn node_id_for(&self, addr: Option<IpAddr>) -> Option<NodeId> {
        self.node_ids
            .iter()
            .find(|(ip, _)| ip.is_some() && *ip == addr)
            .or_else(|| self.node_ids.iter().find(|(ip, _)| ip.is_none()))
            .map(|(_, id)| *id)
    }

    /// Every saved endpoint, IPv4 first.
    pub fn bootstrap_nodes(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.nodes.iter().chain(self.nodes6.iter()).copied()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let ids = self
            .node_ids
            .iter()
            .map(|(ip, id)| {
                let mut raw = Vec::with_capacity(16 + ID_LEN);
                match ip {
                    Some(IpAddr::V4(v4)) => raw.extend_from_slice(&v4.octets()),
                    Some(IpAddr::V6(v6)) => raw.extend_from_slice(&v6.octets()),
                    None => {}
                }
                raw.extend_from_slice(id.as_bytes());
                bytes(raw)
            })
            .collect();

        let endpoints = |eps: &[SocketAddr]| Value::List(eps.iter().map(|ep| bytes(compact_endpoint(ep))).collect());

        let mut d = Dict::new();
        d.set("node-id", Value::List(ids));
        d.set("nodes", endpoints(&self.nodes));
        d.set("nodes6", endpoints(&self.nodes6));
        encode_dict(d).context("failed to encode DHT state")
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let d = decode_dict(buf).context("failed to decode DHT state")?;
        let mut state = DhtState::default();

        match d.get_value("node-id") {
            Some(Value::List(ids)) => {
                for v in ids {
                    if let Value::Bytes(raw) = v {
                        if let Some(entry) = parse_node_id(raw) {
                            state.node_ids.push(entry);
                        }
                    }
                }
            }
            // single legacy string
            Some(Value::Bytes(raw)) => {
                if let Some(entry) = parse_node_id(raw) {
                    state.node_ids.push(entry);
                }
            }
            Some(_) => bail!("invalid 'node-id' in DHT state"),
            None => {}
        }

        for (key, out) in [("nodes", &mut state.nodes), ("nodes6", &mut state.nodes6)] {
            if let Some(list) = d.get_list(key) {
                out.extend(list.iter().filter_map(|v| match v {
                    Value::Bytes(b) => read_endpoint(b),
                    _ => None,
                }));
            }
        }
        Ok(state)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let buf = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_bytes(&buf)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let buf = self.to_bytes()?;
        tokio::fs::write(path, buf)
            .await
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

fn parse_node_id(raw: &[u8]) -> Option<(Option<IpAddr>, NodeId)> {
    match raw.len() {
        ID_LEN => Some((None, NodeId::from_slice(raw)?)),
        24 => {
            let ip = Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]);
            Some((Some(IpAddr::V4(ip)), NodeId::from_slice(&raw[4..])?))
        }
        36 => {
            let octets: [u8; 16] = raw[..16].try_into().ok()?;
            Some((Some(IpAddr::V6(Ipv6Addr::from(octets))), NodeId::from_slice(&raw[16..])?))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DhtState {
        DhtState {
            node_ids: vec![
                (Some("1.2.3.4".parse().unwrap()), NodeId::from_bytes([1; 20])),
                (Some("2001:db8::1".parse().unwrap()), NodeId::from_bytes([2; 20])),
                (None, NodeId::from_bytes([3; 20])),
            ],
            nodes: vec!["10.0.0.1:6881".parse().unwrap()],
            nodes6: vec!["[2001:db8::2]:6881".parse().unwrap()],
        }
    }

    #[test]
    fn encoded_state_reads_back() {
        let state = sample();
        let buf = state.to_bytes().unwrap();
        assert_eq!(DhtState::from_bytes(&buf).unwrap(), state);
    }

    #[test]
    fn node_id_lookup_prefers_matching_interface() {
        let state = sample();
        assert_eq!(state.node_id_for(Some("1.2.3.4".parse().unwrap())), Some(NodeId::from_bytes([1; 20])));
        assert_eq!(state.node_id_for(Some("5.5.5.5".parse().unwrap())), Some(NodeId::from_bytes([3; 20])));
        assert_eq!(state.node_id_for(None), Some(NodeId::from_bytes([3; 20])));
    }

    #[test]
    fn legacy_single_string_id() {
        let mut buf = b"d7:node-id20:".to_vec();
        buf.extend_from_slice(&[9u8; 20]);
        buf.extend_from_slice(b"5:nodesl6:");
        buf.extend_from_slice(&[127, 0, 0, 1, 0x1a, 0xe1]);
        buf.extend_from_slice(b"ee");
        let state = DhtState::from_bytes(&buf).unwrap();
        assert_eq!(state.node_ids, vec![(None, NodeId::from_bytes([9; 20]))]);
        assert_eq!(state.nodes, vec!["127.0.0.1:6881".parse().unwrap()]);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(DhtState::from_bytes(b"not bencode").is_err());
        assert!(DhtState::from_bytes(b"d7:node-idi5ee").is_err());
    }
}
