//! Identity keys.
//!
//! Peer identities are Ed25519. On the wire, private and public keys travel
//! in their libp2p protobuf-marshalled form, base64-encoded; peer ids use
//! the base58btc multihash form.

use libp2p::identity::Keypair;
use serde::Serialize;

use crate::rpc::{RpcError, decode_b64, encode_b64};

/// Result of `generateKeypair`.
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedKeypair {
    pub sk: String,
    pub pk: String,
    pub peer_id: String,
}

/// Generate a fresh Ed25519 identity.
pub fn generate() -> Result<GeneratedKeypair, RpcError> {
    let keypair = Keypair::generate_ed25519();
    let sk = keypair
        .to_protobuf_encoding()
        .map_err(|e| RpcError::internal(format!("marshalling private key: {e}")))?;
    let pk = keypair.public().encode_protobuf();
    Ok(GeneratedKeypair {
        sk: encode_b64(&sk),
        pk: encode_b64(&pk),
        peer_id: keypair.public().to_peer_id().to_base58(),
    })
}

/// Parse a base64 protobuf-marshalled private key, as handed back to us by
/// the host at configure time.
pub fn parse_privk(privk: &str) -> Result<Keypair, RpcError> {
    let bytes = decode_b64(privk)?;
    Keypair::from_protobuf_encoding(&bytes)
        .map_err(|e| RpcError::internal(format!("unmarshalling private key: {e}")))
}
