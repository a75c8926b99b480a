//! On-disk state.
//!
//! Two opaque key-value stores under the configured state directory: the
//! peerstore remembers addresses of peers we have identified, the DHT store
//! carries records accepted under the public-key namespace. Both are
//! best-effort caches: a write failure degrades persistence, never the
//! node, so only opening them can fail.

use std::path::Path;

use libp2p::kad;
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};

use crate::rpc::{RpcError, decode_b64, encode_b64};

pub const PEERSTORE_DIR: &str = "libp2p-peerstore-v0";
pub const DHT_DIR: &str = "libp2p-dht-v0";

pub struct Datastore {
    peerstore: sled::Db,
    dht: sled::Db,
}

/// Serialized form of a DHT record.
#[derive(Serialize, Deserialize)]
struct StoredRecord {
    value: String,
    publisher: Option<String>,
}

impl Datastore {
    pub fn open(statedir: &Path) -> Result<Self, RpcError> {
        let peerstore = sled::open(statedir.join(PEERSTORE_DIR))
            .map_err(|e| RpcError::Initializing(format!("opening peerstore: {e}")))?;
        let dht = sled::open(statedir.join(DHT_DIR))
            .map_err(|e| RpcError::Initializing(format!("opening DHT datastore: {e}")))?;
        Ok(Datastore { peerstore, dht })
    }

    /// Remember an address for a peer. Keyed by peer and address together so
    /// repeated sightings are idempotent.
    pub fn add_peer_addr(&self, peer: &PeerId, addr: &Multiaddr) {
        let key = format!("{} {addr}", peer.to_base58());
        if let Err(e) = self.peerstore.insert(key.as_bytes(), &[]) {
            tracing::warn!(%peer, "persisting peer address failed: {e}");
        }
    }

    /// All addresses seen in previous runs.
    pub fn peer_addrs(&self) -> Vec<(PeerId, Multiaddr)> {
        self.peerstore
            .iter()
            .filter_map(|entry| {
                let (key, _) = entry.ok()?;
                let key = std::str::from_utf8(&key).ok()?;
                let (peer, addr) = key.split_once(' ')?;
                Some((peer.parse().ok()?, addr.parse().ok()?))
            })
            .collect()
    }

    pub fn put_record(&self, record: &kad::Record) {
        let stored = StoredRecord {
            value: encode_b64(&record.value),
            publisher: record.publisher.map(|p| p.to_base58()),
        };
        let encoded = match serde_json::to_vec(&stored) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("serializing DHT record failed: {e}");
                return;
            }
        };
        if let Err(e) = self.dht.insert(record.key.as_ref(), encoded) {
            tracing::warn!("persisting DHT record failed: {e}");
        }
    }

    /// Records from previous runs, reloaded into the in-memory store at
    /// configure time. Expiry restarts from scratch.
    pub fn records(&self) -> Vec<kad::Record> {
        self.dht
            .iter()
            .filter_map(|entry| {
                let (key, value) = entry.ok()?;
                let stored: StoredRecord = serde_json::from_slice(&value).ok()?;
                Some(kad::Record {
                    key: kad::RecordKey::from(key.to_vec()),
                    value: decode_b64(&stored.value).ok()?,
                    publisher: stored.publisher.and_then(|p| p.parse().ok()),
                    expires: None,
                })
            })
            .collect()
    }
}
