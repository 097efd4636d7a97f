use std::io::prelude::*;
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::Result;
use local_ip_address::list_afinet_netifas;
use serde::Deserialize;

use super::{barrier, exchange};

/// Default TCP port for the barrier; pairwise exchanges use ports above it.
pub const DEFAULT_BASE_PORT: u16 = 18515;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    rdmesh: ConfigSection,
}

#[derive(Debug, Deserialize)]
struct ConfigSection {
    peers: Vec<Ipv4Addr>,
    device: Option<String>,
    base_port: Option<u16>,
}

/// Cluster membership: the ordered peer list that defines ranks, plus the
/// TCP port range of the bootstrap transport.
#[derive(Debug, Clone)]
pub struct Roster {
    peers: Vec<Ipv4Addr>,
    rank: usize,
    base_port: u16,
    device: Option<String>,
}

impl Roster {
    /// Build a roster, inferring the own rank by matching the peer list
    /// against this host's interface addresses.
    pub fn new(peers: Vec<Ipv4Addr>) -> Result<Self> {
        let my_ips = list_afinet_netifas()?;
        let rank = peers
            .iter()
            .position(|peer| {
                my_ips
                    .iter()
                    .any(|(_iface, ip)| *ip == std::net::IpAddr::V4(*peer))
            })
            .ok_or_else(|| anyhow::anyhow!("none of this host's addresses appears in the roster"))?;
        Ok(Self::with_rank(peers, rank))
    }

    /// Build a roster with an explicitly assigned rank.
    pub fn with_rank(peers: Vec<Ipv4Addr>, rank: usize) -> Self {
        assert!(rank < peers.len(), "rank {} out of a {}-peer roster", rank, peers.len());
        Self {
            peers,
            rank,
            base_port: DEFAULT_BASE_PORT,
            device: None,
        }
    }

    /// Load a roster from a TOML document of the form:
    ///
    /// ```toml
    /// [rdmesh]
    /// peers = ["10.0.2.1", "10.0.2.2", "10.0.2.3"]
    /// device = "mlx5_0"     # optional; absent means "first device"
    /// base_port = 18515     # optional
    /// ```
    ///
    /// Unrelated tables are ignored, so the snippet can live inside a larger
    /// configuration file.
    pub fn from_toml(toml: &str) -> Result<Self> {
        let config: ConfigFile = toml::from_str(toml)?;
        let mut roster = Self::new(config.rdmesh.peers)?;
        roster.device = config.rdmesh.device;
        if let Some(port) = config.rdmesh.base_port {
            roster.base_port = port;
        }
        Ok(roster)
    }

    /// Load a roster from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut toml_str = String::new();
        std::fs::File::open(path)?.read_to_string(&mut toml_str)?;
        Self::from_toml(&toml_str)
    }

    /// Override the base TCP port.
    pub fn set_base_port(&mut self, port: u16) -> &mut Self {
        self.base_port = port;
        self
    }

    /// This node's rank.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Number of nodes.
    #[inline]
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    /// The RDMA device name from the configuration, if any.
    #[inline]
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    #[inline]
    pub(crate) fn base_port(&self) -> u16 {
        self.base_port
    }

    #[inline]
    pub(crate) fn peer_ip(&self, rank: usize) -> Ipv4Addr {
        self.peers[rank]
    }

    /// Block until every node in the roster has reached this point.
    pub fn barrier(&self) {
        barrier::wait(self);
    }

    /// Blocking symmetric exchange of fixed-size byte buffers with one
    /// counterpart rank. Transport failure is fatal.
    pub fn send_recv(&self, with: usize, send: &[u8], recv: &mut [u8]) {
        exchange::send_recv(self, with, send, recv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_roster_with_explicit_fields() {
        // `new` would try to infer the rank from live interfaces, so parse
        // the section by hand through the same structures.
        let config: ConfigFile = toml::from_str(
            r#"
            [rdmesh]
            peers = ["10.0.2.1", "10.0.2.2"]
            device = "mlx5_0"
            base_port = 20000

            [unrelated]
            key = "ignored"
            "#,
        )
        .unwrap();
        assert_eq!(config.rdmesh.peers.len(), 2);
        assert_eq!(config.rdmesh.device.as_deref(), Some("mlx5_0"));
        assert_eq!(config.rdmesh.base_port, Some(20000));
    }

    #[test]
    fn explicit_rank_roster() {
        let roster = Roster::with_rank(
            vec![Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2)],
            1,
        );
        assert_eq!(roster.rank(), 1);
        assert_eq!(roster.size(), 2);
        assert_eq!(roster.peer_ip(0), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(roster.device(), None);
    }

    #[test]
    #[should_panic]
    fn rank_must_be_in_roster() {
        Roster::with_rank(vec![Ipv4Addr::new(10, 0, 0, 1)], 3);
    }
}
