//! Wire types for the JSON pipe.
//!
//! Framing is one JSON object per line in both directions. Requests arrive
//! as an [`Envelope`] whose integer `method` tag selects the body shape;
//! every request produces exactly one response carrying the same `seqno`.
//! Unsolicited helper-to-host messages are [`Upcall`]s, discriminated by a
//! literal `upcall` string and never carrying a response seqno.
//!
//! Binary blobs are standard base64 with padding, everywhere.

use anyhow::{Context, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use libp2p::{Multiaddr, PeerId, multiaddr::Protocol};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gating::GatingConfig;
use crate::pubsub::Verdict;

/// Request envelope: `{"method": <int>, "seqno": <int>, "body": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub method: u16,
    pub seqno: u64,
    #[serde(default)]
    pub body: Value,
}

// Method tags are positional and stable; the integer on the wire is the
// source of truth, not the name.
pub const METHOD_CONFIGURE: u16 = 0;
pub const METHOD_LISTEN: u16 = 1;
pub const METHOD_PUBLISH: u16 = 2;
pub const METHOD_SUBSCRIBE: u16 = 3;
pub const METHOD_UNSUBSCRIBE: u16 = 4;
pub const METHOD_VALIDATION_COMPLETE: u16 = 5;
pub const METHOD_GENERATE_KEYPAIR: u16 = 6;
pub const METHOD_OPEN_STREAM: u16 = 7;
pub const METHOD_CLOSE_STREAM: u16 = 8;
pub const METHOD_RESET_STREAM: u16 = 9;
pub const METHOD_SEND_STREAM_MSG: u16 = 10;
pub const METHOD_REMOVE_STREAM_HANDLER: u16 = 11;
pub const METHOD_ADD_STREAM_HANDLER: u16 = 12;
pub const METHOD_LISTENING_ADDRS: u16 = 13;
pub const METHOD_ADD_PEER: u16 = 14;
pub const METHOD_BEGIN_ADVERTISING: u16 = 15;
pub const METHOD_FIND_PEER: u16 = 16;
pub const METHOD_LIST_PEERS: u16 = 17;
pub const METHOD_SET_GATING_CONFIG: u16 = 18;

/// A decoded request, one variant per method tag.
#[derive(Debug, Clone)]
pub enum Request {
    Configure(ConfigureBody),
    Listen(ListenBody),
    Publish(PublishBody),
    Subscribe(SubscribeBody),
    Unsubscribe(UnsubscribeBody),
    ValidationComplete(ValidationCompleteBody),
    GenerateKeypair,
    OpenStream(OpenStreamBody),
    CloseStream(StreamIdxBody),
    ResetStream(StreamIdxBody),
    SendStreamMsg(SendStreamMsgBody),
    RemoveStreamHandler(ProtocolBody),
    AddStreamHandler(ProtocolBody),
    ListeningAddrs,
    AddPeer(AddPeerBody),
    BeginAdvertising,
    FindPeer(FindPeerBody),
    ListPeers,
    SetGatingConfig(GatingConfig),
}

impl Request {
    /// Decode a request body against its method tag. An unknown tag or a
    /// body that does not deserialize is a protocol violation and fatal to
    /// the caller.
    pub fn decode(method: u16, body: Value) -> anyhow::Result<Self> {
        fn parse<T: serde::de::DeserializeOwned>(method: u16, body: Value) -> anyhow::Result<T> {
            serde_json::from_value(body)
                .with_context(|| format!("malformed body for method {method}"))
        }
        Ok(match method {
            METHOD_CONFIGURE => Request::Configure(parse(method, body)?),
            METHOD_LISTEN => Request::Listen(parse(method, body)?),
            METHOD_PUBLISH => Request::Publish(parse(method, body)?),
            METHOD_SUBSCRIBE => Request::Subscribe(parse(method, body)?),
            METHOD_UNSUBSCRIBE => Request::Unsubscribe(parse(method, body)?),
            METHOD_VALIDATION_COMPLETE => Request::ValidationComplete(parse(method, body)?),
            METHOD_GENERATE_KEYPAIR => Request::GenerateKeypair,
            METHOD_OPEN_STREAM => Request::OpenStream(parse(method, body)?),
            METHOD_CLOSE_STREAM => Request::CloseStream(parse(method, body)?),
            METHOD_RESET_STREAM => Request::ResetStream(parse(method, body)?),
            METHOD_SEND_STREAM_MSG => Request::SendStreamMsg(parse(method, body)?),
            METHOD_REMOVE_STREAM_HANDLER => Request::RemoveStreamHandler(parse(method, body)?),
            METHOD_ADD_STREAM_HANDLER => Request::AddStreamHandler(parse(method, body)?),
            METHOD_LISTENING_ADDRS => Request::ListeningAddrs,
            METHOD_ADD_PEER => Request::AddPeer(parse(method, body)?),
            METHOD_BEGIN_ADVERTISING => Request::BeginAdvertising,
            METHOD_FIND_PEER => Request::FindPeer(parse(method, body)?),
            METHOD_LIST_PEERS => Request::ListPeers,
            METHOD_SET_GATING_CONFIG => Request::SetGatingConfig(parse(method, body)?),
            other => bail!("unknown method tag {other}"),
        })
    }

    /// Method name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Configure(_) => "configure",
            Request::Listen(_) => "listen",
            Request::Publish(_) => "publish",
            Request::Subscribe(_) => "subscribe",
            Request::Unsubscribe(_) => "unsubscribe",
            Request::ValidationComplete(_) => "validationComplete",
            Request::GenerateKeypair => "generateKeypair",
            Request::OpenStream(_) => "openStream",
            Request::CloseStream(_) => "closeStream",
            Request::ResetStream(_) => "resetStream",
            Request::SendStreamMsg(_) => "sendStreamMsg",
            Request::RemoveStreamHandler(_) => "removeStreamHandler",
            Request::AddStreamHandler(_) => "addStreamHandler",
            Request::ListeningAddrs => "listeningAddrs",
            Request::AddPeer(_) => "addPeer",
            Request::BeginAdvertising => "beginAdvertising",
            Request::FindPeer(_) => "findPeer",
            Request::ListPeers => "listPeers",
            Request::SetGatingConfig(_) => "setGatingConfig",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureBody {
    pub statedir: String,
    pub privk: String,
    pub network_id: String,
    #[serde(default)]
    pub ifaces: Vec<String>,
    #[serde(default)]
    pub external_maddr: String,
    #[serde(default)]
    pub unsafe_no_trust_ip: bool,
    #[serde(default)]
    pub flood: bool,
    #[serde(default)]
    pub peer_exchange: bool,
    #[serde(default)]
    pub direct_peers: Vec<String>,
    #[serde(default)]
    pub seed_peers: Vec<String>,
    #[serde(default)]
    pub gating_config: GatingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenBody {
    pub iface: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishBody {
    pub topic: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeBody {
    pub topic: String,
    pub subscription_idx: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnsubscribeBody {
    pub subscription_idx: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationCompleteBody {
    pub seqno: u64,
    pub is_valid: Verdict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenStreamBody {
    pub peer: String,
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamIdxBody {
    pub stream_idx: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendStreamMsgBody {
    pub stream_idx: u64,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolBody {
    pub protocol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddPeerBody {
    pub multiaddr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FindPeerBody {
    pub peer_id: String,
}

/// Per-request error, serialized on the wire as `"<tag>: <detail>"`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("internal RPC error: {0}")]
    Internal(String),
    #[error("libp2p error: {0}")]
    Libp2p(String),
    #[error("initializing helper: {0}")]
    Initializing(String),
    #[error("initializing external addr: {0}")]
    ExternalAddr(String),
}

impl RpcError {
    pub fn internal(detail: impl Into<String>) -> Self {
        RpcError::Internal(detail.into())
    }

    pub fn libp2p(detail: impl std::fmt::Display) -> Self {
        RpcError::Libp2p(detail.to_string())
    }
}

/// Successful response: `{"seqno": n, "success": ..., "duration": "12.3ms"}`.
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub seqno: u64,
    pub success: Value,
    pub duration: String,
}

/// Failed response: `{"seqno": n, "error": "<tag>: <detail>"}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub seqno: u64,
    pub error: String,
}

/// Unsolicited helper-to-host message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "upcall")]
pub enum Upcall {
    /// Ask the host to validate an inbound gossip message. `seqno` here is
    /// the validation ticket, answered via `validationComplete`.
    #[serde(rename = "validate")]
    Validate {
        sender: PeerInfo,
        data: String,
        seqno: u64,
        subscription_idx: u64,
    },
    /// Reserved: post-validation delivery is suppressed, the host already
    /// received the payload inside `validate`.
    #[serde(rename = "publish")]
    Publish {
        subscription_idx: u64,
        data: String,
        sender: PeerInfo,
    },
    #[serde(rename = "incomingStream")]
    IncomingStream {
        peer: PeerInfo,
        stream_idx: u64,
        protocol: String,
    },
    #[serde(rename = "incomingStreamMsg")]
    IncomingStreamMsg { stream_idx: u64, data: String },
    #[serde(rename = "streamReadComplete")]
    StreamReadComplete { stream_idx: u64 },
    #[serde(rename = "streamLost")]
    StreamLost { stream_idx: u64, reason: String },
    #[serde(rename = "discoveredPeer")]
    DiscoveredPeer {
        peer_id: String,
        multiaddrs: Vec<String>,
    },
}

/// A peer as the host sees it: dialable host/port plus the base58 peer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub host: String,
    pub libp2p_port: u16,
    pub peer_id: String,
}

impl PeerInfo {
    /// Derive a `PeerInfo` from a remote multiaddress. Only addresses whose
    /// first component is IPv4 or IPv6 followed immediately by TCP qualify.
    pub fn from_multiaddr(peer: &PeerId, addr: &Multiaddr) -> Option<Self> {
        let mut parts = addr.iter();
        let host = match parts.next()? {
            Protocol::Ip4(ip) => ip.to_string(),
            Protocol::Ip6(ip) => ip.to_string(),
            _ => return None,
        };
        let libp2p_port = match parts.next()? {
            Protocol::Tcp(port) => port,
            _ => return None,
        };
        Some(PeerInfo {
            host,
            libp2p_port,
            peer_id: peer.to_base58(),
        })
    }

    /// The testing-only stand-in used when `unsafe_no_trust_ip` is set and
    /// the real remote address is unknown.
    pub fn loopback(peer: &PeerId) -> Self {
        PeerInfo {
            host: "127.0.0.1".to_string(),
            libp2p_port: 0,
            peer_id: peer.to_base58(),
        }
    }
}

/// Standard base64 (with padding) for binary blobs inside JSON.
pub fn encode_b64(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_b64(data: &str) -> Result<Vec<u8>, RpcError> {
    BASE64
        .decode(data)
        .map_err(|e| RpcError::internal(format!("invalid base64 payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_decodes_with_default_body() {
        let env: Envelope = serde_json::from_str(r#"{"method":6,"seqno":1}"#).unwrap();
        assert_eq!(env.method, METHOD_GENERATE_KEYPAIR);
        assert_eq!(env.seqno, 1);
        assert!(matches!(
            Request::decode(env.method, env.body).unwrap(),
            Request::GenerateKeypair
        ));
    }

    #[test]
    fn method_tags_are_positional() {
        let publish = Request::decode(2, json!({"topic": "t", "data": "aGk="})).unwrap();
        assert!(matches!(publish, Request::Publish(_)));
        let gen_req = Request::decode(6, json!({})).unwrap();
        assert_eq!(gen_req.name(), "generateKeypair");
        let gating = Request::decode(18, json!({"isolate": true})).unwrap();
        assert!(matches!(gating, Request::SetGatingConfig(c) if c.isolate));
    }

    #[test]
    fn unknown_method_is_an_error() {
        assert!(Request::decode(99, json!({})).is_err());
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(Request::decode(METHOD_PUBLISH, json!({"topic": 42})).is_err());
    }

    #[test]
    fn responses_never_carry_an_upcall_field() {
        let ok = serde_json::to_value(SuccessResponse {
            seqno: 7,
            success: json!({}),
            duration: "1ms".into(),
        })
        .unwrap();
        assert_eq!(ok["seqno"], 7);
        assert!(ok.get("upcall").is_none());

        let err = serde_json::to_value(ErrorResponse {
            seqno: 8,
            error: RpcError::internal("helper not yet configured").to_string(),
        })
        .unwrap();
        assert_eq!(err["seqno"], 8);
        assert_eq!(err["error"], "internal RPC error: helper not yet configured");
        assert!(err.get("upcall").is_none());
    }

    #[test]
    fn upcalls_carry_the_discriminator() {
        let up = serde_json::to_value(Upcall::StreamReadComplete { stream_idx: 3 }).unwrap();
        assert_eq!(up["upcall"], "streamReadComplete");
        assert_eq!(up["stream_idx"], 3);
        assert!(up.get("seqno").is_none());

        let lost = serde_json::to_value(Upcall::StreamLost {
            stream_idx: 3,
            reason: "reset".into(),
        })
        .unwrap();
        assert_eq!(lost["upcall"], "streamLost");
        assert_eq!(lost["reason"], "reset");
    }

    #[test]
    fn validate_upcall_carries_its_ticket() {
        let peer = PeerId::random();
        let up = serde_json::to_value(Upcall::Validate {
            sender: PeerInfo::loopback(&peer),
            data: encode_b64(b"hello"),
            seqno: 42,
            subscription_idx: 7,
        })
        .unwrap();
        assert_eq!(up["upcall"], "validate");
        assert_eq!(up["seqno"], 42);
        assert_eq!(up["subscription_idx"], 7);
        assert_eq!(up["data"], "aGVsbG8=");
    }

    #[test]
    fn peer_info_requires_ip_then_tcp() {
        let peer = PeerId::random();
        let good: Multiaddr = "/ip4/10.0.0.1/tcp/8302".parse().unwrap();
        let info = PeerInfo::from_multiaddr(&peer, &good).unwrap();
        assert_eq!(info.host, "10.0.0.1");
        assert_eq!(info.libp2p_port, 8302);
        assert_eq!(info.peer_id, peer.to_base58());

        let udp: Multiaddr = "/ip4/10.0.0.1/udp/8302".parse().unwrap();
        assert!(PeerInfo::from_multiaddr(&peer, &udp).is_none());
        let dns: Multiaddr = "/dns4/example.com/tcp/8302".parse().unwrap();
        assert!(PeerInfo::from_multiaddr(&peer, &dns).is_none());
    }

    #[test]
    fn base64_round_trip_is_standard_with_padding() {
        assert_eq!(encode_b64(b"hi"), "aGk=");
        assert_eq!(decode_b64("aGVsbG8=").unwrap(), b"hello");
        assert!(decode_b64("not base64!").is_err());
    }
}
