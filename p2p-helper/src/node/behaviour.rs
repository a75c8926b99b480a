//! Composite network behaviour.

use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::NetworkBehaviour;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::{StreamProtocol, gossipsub, identify, kad, mdns, ping, upnp};

use crate::gating::{self, SharedPolicy};
use crate::rpc::RpcError;

use super::{GOSSIP_MAX_TRANSMIT, KAD_PROTOCOL_NAME, MDNS_QUERY_INTERVAL};

#[derive(NetworkBehaviour)]
pub struct Behaviour {
    /// Allow/deny checks at dial, accept, and secure checkpoints.
    pub gating: gating::Behaviour,
    pub ping: ping::Behaviour,
    /// Identify feeds learned listen addresses into the routing table and
    /// the peerstore.
    pub identify: identify::Behaviour,
    /// NAT port-mapping for the listen ports.
    pub upnp: upnp::tokio::Behaviour,
    /// Local-network discovery. Optional: a host without multicast support
    /// still gets a working node.
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub kad: kad::Behaviour<MemoryStore>,
    pub gossipsub: gossipsub::Behaviour,
    /// Application-defined bidirectional streams.
    pub streams: libp2p_stream::Behaviour,
}

impl Behaviour {
    pub fn new(
        keypair: &Keypair,
        rendezvous: &str,
        flood: bool,
        peer_exchange: bool,
        policy: SharedPolicy,
    ) -> Result<Self, RpcError> {
        let peer_id = keypair.public().to_peer_id();

        let identify = identify::Behaviour::new(
            identify::Config::new(rendezvous.to_string(), keypair.public()).with_agent_version(
                format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            ),
        );

        let mdns = Toggle::from(
            match mdns::tokio::Behaviour::new(
                mdns::Config {
                    query_interval: MDNS_QUERY_INTERVAL,
                    ..Default::default()
                },
                peer_id,
            ) {
                Ok(mdns) => Some(mdns),
                Err(e) => {
                    tracing::warn!("mDNS unavailable, local discovery disabled: {e}");
                    None
                }
            },
        );

        let mut kad_config = kad::Config::new(StreamProtocol::new(KAD_PROTOCOL_NAME));
        // Inbound records are not stored until the event loop has checked
        // their namespace.
        kad_config.set_record_filtering(kad::StoreInserts::FilterBoth);
        let mut kad =
            kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
        kad.set_mode(Some(kad::Mode::Server));

        let mut gossip_config = gossipsub::ConfigBuilder::default();
        gossip_config
            .max_transmit_size(GOSSIP_MAX_TRANSMIT)
            .validation_mode(gossipsub::ValidationMode::Strict)
            // Every inbound message waits for an explicit verdict from the
            // validator bridge.
            .validate_messages()
            .flood_publish(flood);
        if peer_exchange {
            gossip_config.do_px();
        }
        let gossip_config = gossip_config
            .build()
            .map_err(|e| RpcError::Initializing(format!("gossipsub config: {e}")))?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossip_config,
        )
        .map_err(|e| RpcError::Initializing(format!("gossipsub: {e}")))?;

        Ok(Behaviour {
            gating: gating::Behaviour::new(policy),
            ping: ping::Behaviour::default(),
            identify,
            upnp: upnp::tokio::Behaviour::default(),
            mdns,
            kad,
            gossipsub,
            streams: libp2p_stream::Behaviour::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gating::GatingPolicy;
    use std::sync::Arc;

    #[tokio::test]
    async fn behaviour_builds_with_defaults() {
        let keypair = Keypair::generate_ed25519();
        let policy = Arc::new(parking_lot::RwLock::new(GatingPolicy::default()));
        let behaviour = Behaviour::new(&keypair, "/coda/0.0.1/test", true, false, policy);
        assert!(behaviour.is_ok());
    }
}
