//! Connection gating.
//!
//! A mutable allow/deny policy over peer ids and IP networks, consulted at
//! every dial, accept, and security upgrade. The policy is replaced
//! atomically by `setGatingConfig`; existing connections are left alone and
//! the new rules apply only at future checkpoints.
//!
//! The enforcement point is [`Behaviour`], a handler-less network behaviour
//! whose pending/established connection hooks reject connections the policy
//! denies, the same shape libp2p's own allow/block lists use.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;
use std::task::{Context, Poll};

use ip_network::IpNetwork;
use libp2p::core::Endpoint;
use libp2p::core::transport::PortUse;
use libp2p::multiaddr::Protocol;
use libp2p::swarm::{
    ConnectionDenied, ConnectionId, FromSwarm, NetworkBehaviour, THandlerInEvent, ToSwarm, dummy,
};
use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use serde::Deserialize;

use crate::rpc::RpcError;

/// Gating rules as the host sends them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatingConfig {
    #[serde(default)]
    pub banned_ips: Vec<String>,
    #[serde(default)]
    pub banned_peers: Vec<String>,
    #[serde(default)]
    pub trusted_ips: Vec<String>,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    #[serde(default)]
    pub isolate: bool,
}

/// Compiled gating rules.
///
/// Trusted peers strictly override banned peers: a peer in both sets is
/// allowed. `isolate` acts as a deny-all address filter on top of which the
/// trusted IP entries still apply.
#[derive(Debug, Default)]
pub struct GatingPolicy {
    banned_ips: Vec<IpNetwork>,
    trusted_ips: Vec<IpNetwork>,
    banned_peers: HashSet<PeerId>,
    trusted_peers: HashSet<PeerId>,
    isolate: bool,
}

/// Replaced wholesale on `setGatingConfig`; readers see either the full old
/// or the full new policy.
pub type SharedPolicy = Arc<RwLock<GatingPolicy>>;

fn parse_network(s: &str) -> Result<IpNetwork, RpcError> {
    if let Ok(network) = s.parse::<IpNetwork>() {
        return Ok(network);
    }
    // Bare addresses gate exactly one host.
    let ip: IpAddr = s
        .parse()
        .map_err(|_| RpcError::internal(format!("invalid IP or CIDR in gating config: {s}")))?;
    let prefix = match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    IpNetwork::new(ip, prefix)
        .map_err(|e| RpcError::internal(format!("invalid IP in gating config: {s}: {e}")))
}

fn parse_peers(ids: &[String]) -> Result<HashSet<PeerId>, RpcError> {
    ids.iter()
        .map(|s| {
            s.parse::<PeerId>()
                .map_err(|_| RpcError::internal(format!("invalid peer id in gating config: {s}")))
        })
        .collect()
}

impl GatingPolicy {
    pub fn from_config(config: &GatingConfig) -> Result<Self, RpcError> {
        Ok(GatingPolicy {
            banned_ips: config
                .banned_ips
                .iter()
                .map(|s| parse_network(s))
                .collect::<Result<_, _>>()?,
            trusted_ips: config
                .trusted_ips
                .iter()
                .map(|s| parse_network(s))
                .collect::<Result<_, _>>()?,
            banned_peers: parse_peers(&config.banned_peers)?,
            trusted_peers: parse_peers(&config.trusted_peers)?,
            isolate: config.isolate,
        })
    }

    /// Peer rule: allowed iff trusted, or not banned.
    pub fn allows_peer(&self, peer: &PeerId) -> bool {
        self.trusted_peers.contains(peer) || !self.banned_peers.contains(peer)
    }

    /// Address rule: trusted IPs always pass; otherwise `isolate` denies
    /// everything and banned networks deny their members.
    pub fn allows_ip(&self, ip: IpAddr) -> bool {
        if self.trusted_ips.iter().any(|n| n.contains(ip)) {
            return true;
        }
        if self.isolate {
            return false;
        }
        !self.banned_ips.iter().any(|n| n.contains(ip))
    }

    /// Address rule applied to a multiaddress. Addresses without an IP
    /// component (e.g. memory transports in tests) have nothing to match
    /// and pass.
    pub fn allows_addr(&self, addr: &Multiaddr) -> bool {
        match multiaddr_ip(addr) {
            Some(ip) => self.allows_ip(ip),
            None => true,
        }
    }

    /// Combined rule applied once the connection is secured and the remote
    /// identity is known.
    pub fn allows_secured(&self, peer: &PeerId, addr: &Multiaddr) -> bool {
        self.allows_peer(peer) && self.allows_addr(addr)
    }
}

fn multiaddr_ip(addr: &Multiaddr) -> Option<IpAddr> {
    addr.iter().find_map(|p| match p {
        Protocol::Ip4(ip) => Some(IpAddr::V4(ip)),
        Protocol::Ip6(ip) => Some(IpAddr::V6(ip)),
        _ => None,
    })
}

#[derive(Debug, thiserror::Error)]
#[error("connection gated: {0}")]
struct Gated(&'static str);

/// Handler-less behaviour that enforces the shared policy at the swarm's
/// connection checkpoints.
pub struct Behaviour {
    policy: SharedPolicy,
}

impl Behaviour {
    pub fn new(policy: SharedPolicy) -> Self {
        Self { policy }
    }
}

impl NetworkBehaviour for Behaviour {
    type ConnectionHandler = dummy::ConnectionHandler;
    type ToSwarm = Infallible;

    fn handle_pending_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<(), ConnectionDenied> {
        // The remote identity is not known yet; only the address can be
        // judged here.
        if !self.policy.read().allows_addr(remote_addr) {
            return Err(ConnectionDenied::new(Gated("inbound address denied")));
        }
        Ok(())
    }

    fn handle_pending_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        maybe_peer: Option<PeerId>,
        _addresses: &[Multiaddr],
        _effective_role: Endpoint,
    ) -> Result<Vec<Multiaddr>, ConnectionDenied> {
        if let Some(peer) = maybe_peer
            && !self.policy.read().allows_peer(&peer)
        {
            return Err(ConnectionDenied::new(Gated("outbound peer denied")));
        }
        Ok(Vec::new())
    }

    fn handle_established_inbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        _local_addr: &Multiaddr,
        remote_addr: &Multiaddr,
    ) -> Result<Self::ConnectionHandler, ConnectionDenied> {
        if !self.policy.read().allows_secured(&peer, remote_addr) {
            return Err(ConnectionDenied::new(Gated("secured inbound denied")));
        }
        Ok(dummy::ConnectionHandler)
    }

    fn handle_established_outbound_connection(
        &mut self,
        _connection_id: ConnectionId,
        peer: PeerId,
        addr: &Multiaddr,
        _role_override: Endpoint,
        _port_use: PortUse,
    ) -> Result<Self::ConnectionHandler, ConnectionDenied> {
        if !self.policy.read().allows_secured(&peer, addr) {
            return Err(ConnectionDenied::new(Gated("secured outbound denied")));
        }
        Ok(dummy::ConnectionHandler)
    }

    fn on_swarm_event(&mut self, _event: FromSwarm) {}

    fn on_connection_handler_event(
        &mut self,
        _peer: PeerId,
        _connection: ConnectionId,
        event: Infallible,
    ) {
        match event {}
    }

    fn poll(
        &mut self,
        _cx: &mut Context<'_>,
    ) -> Poll<ToSwarm<Self::ToSwarm, THandlerInEvent<Self>>> {
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(config: GatingConfig) -> GatingPolicy {
        GatingPolicy::from_config(&config).unwrap()
    }

    #[test]
    fn default_policy_allows_everything() {
        let p = policy(GatingConfig::default());
        assert!(p.allows_peer(&PeerId::random()));
        assert!(p.allows_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn trusted_peer_overrides_banned_peer() {
        let peer = PeerId::random();
        let p = policy(GatingConfig {
            banned_peers: vec![peer.to_base58()],
            trusted_peers: vec![peer.to_base58()],
            ..Default::default()
        });
        assert!(p.allows_peer(&peer));

        let banned_only = policy(GatingConfig {
            banned_peers: vec![peer.to_base58()],
            ..Default::default()
        });
        assert!(!banned_only.allows_peer(&peer));
        assert!(banned_only.allows_peer(&PeerId::random()));
    }

    #[test]
    fn banned_cidr_matches_members_only() {
        let p = policy(GatingConfig {
            banned_ips: vec!["10.1.0.0/16".into()],
            ..Default::default()
        });
        assert!(!p.allows_ip("10.1.2.3".parse().unwrap()));
        assert!(p.allows_ip("10.2.2.3".parse().unwrap()));
    }

    #[test]
    fn bare_ip_gates_a_single_host() {
        let p = policy(GatingConfig {
            banned_ips: vec!["192.168.1.5".into()],
            ..Default::default()
        });
        assert!(!p.allows_ip("192.168.1.5".parse().unwrap()));
        assert!(p.allows_ip("192.168.1.6".parse().unwrap()));
    }

    #[test]
    fn isolate_denies_all_but_trusted_ips() {
        let p = policy(GatingConfig {
            trusted_ips: vec!["127.0.0.1".into()],
            isolate: true,
            ..Default::default()
        });
        assert!(p.allows_ip("127.0.0.1".parse().unwrap()));
        assert!(!p.allows_ip("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn secured_check_combines_peer_and_address() {
        let peer = PeerId::random();
        let p = policy(GatingConfig {
            banned_ips: vec!["10.0.0.0/8".into()],
            banned_peers: vec![peer.to_base58()],
            ..Default::default()
        });
        let denied_addr: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let ok_addr: Multiaddr = "/ip4/1.2.3.4/tcp/1".parse().unwrap();
        assert!(!p.allows_secured(&peer, &ok_addr));
        assert!(!p.allows_secured(&PeerId::random(), &denied_addr));
        assert!(p.allows_secured(&PeerId::random(), &ok_addr));
    }

    #[test]
    fn addresses_without_ip_component_pass() {
        let p = policy(GatingConfig {
            isolate: true,
            ..Default::default()
        });
        let mem: Multiaddr = "/memory/1".parse().unwrap();
        assert!(p.allows_addr(&mem));
    }

    #[test]
    fn invalid_entries_are_rejected() {
        assert!(
            GatingPolicy::from_config(&GatingConfig {
                banned_ips: vec!["not an ip".into()],
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            GatingPolicy::from_config(&GatingConfig {
                trusted_peers: vec!["not a peer id".into()],
                ..Default::default()
            })
            .is_err()
        );
    }
}
