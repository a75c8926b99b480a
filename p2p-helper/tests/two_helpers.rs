//! End-to-end scenarios: two helpers wired together over real localhost
//! sockets, each driven over its own JSON pipe like the host would.
//!
//! Helpers are isolated per test by the network id: it keys the private
//! network PSK, so nodes of different tests cannot even handshake.

use std::collections::VecDeque;
use std::time::Duration;

use p2p_helper::rpc::{decode_b64, encode_b64};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};

const METHOD_CONFIGURE: u16 = 0;
const METHOD_PUBLISH: u16 = 2;
const METHOD_SUBSCRIBE: u16 = 3;
const METHOD_VALIDATION_COMPLETE: u16 = 5;
const METHOD_GENERATE_KEYPAIR: u16 = 6;
const METHOD_OPEN_STREAM: u16 = 7;
const METHOD_CLOSE_STREAM: u16 = 8;
const METHOD_SEND_STREAM_MSG: u16 = 10;
const METHOD_ADD_STREAM_HANDLER: u16 = 12;
const METHOD_LISTENING_ADDRS: u16 = 13;
const METHOD_LIST_PEERS: u16 = 17;
const METHOD_SET_GATING_CONFIG: u16 = 18;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

struct Helper {
    input: tokio::io::WriteHalf<DuplexStream>,
    lines: Lines<BufReader<tokio::io::ReadHalf<DuplexStream>>>,
    pending_upcalls: VecDeque<Value>,
    pending_responses: VecDeque<Value>,
    next_seqno: u64,
}

impl Helper {
    fn spawn() -> Self {
        let (host_side, helper_side) = tokio::io::duplex(1 << 20);
        let (helper_read, helper_write) = tokio::io::split(helper_side);
        tokio::spawn(async move {
            let _ = p2p_helper::dispatch::run(helper_read, helper_write).await;
        });
        let (host_read, host_write) = tokio::io::split(host_side);
        Helper {
            input: host_write,
            lines: BufReader::new(host_read).lines(),
            pending_upcalls: VecDeque::new(),
            pending_responses: VecDeque::new(),
            next_seqno: 1,
        }
    }

    async fn next_json(&mut self) -> Option<Value> {
        let line = tokio::time::timeout(IO_TIMEOUT, self.lines.next_line())
            .await
            .ok()?
            .unwrap()?;
        Some(serde_json::from_str(&line).expect("helper emitted unparseable JSON"))
    }

    async fn call(&mut self, method: u16, body: Value) -> Value {
        let seqno = self.next_seqno;
        self.next_seqno += 1;
        let line = json!({"method": method, "seqno": seqno, "body": body}).to_string() + "\n";
        self.input.write_all(line.as_bytes()).await.unwrap();

        if let Some(pos) = self
            .pending_responses
            .iter()
            .position(|r| r["seqno"] == seqno)
        {
            return self.pending_responses.remove(pos).unwrap();
        }
        loop {
            let msg = self.next_json().await.expect("helper output closed");
            if msg.get("upcall").is_some() {
                self.pending_upcalls.push_back(msg);
            } else if msg["seqno"] == seqno {
                return msg;
            } else {
                self.pending_responses.push_back(msg);
            }
        }
    }

    async fn call_ok(&mut self, method: u16, body: Value) -> Value {
        let response = self.call(method, body).await;
        assert!(
            response.get("error").is_none(),
            "request {method} failed: {response}"
        );
        response["success"].clone()
    }

    /// Wait for an upcall of the given kind, up to `deadline`.
    async fn upcall_within(&mut self, kind: &str, deadline: Duration) -> Option<Value> {
        if let Some(pos) = self
            .pending_upcalls
            .iter()
            .position(|u| u["upcall"] == kind)
        {
            return self.pending_upcalls.remove(pos);
        }
        let waited = tokio::time::Instant::now();
        while waited.elapsed() < deadline {
            let msg = match tokio::time::timeout(deadline, self.lines.next_line()).await {
                Ok(Ok(Some(line))) => {
                    serde_json::from_str::<Value>(&line).expect("unparseable JSON")
                }
                _ => return None,
            };
            if msg["upcall"] == kind {
                return Some(msg);
            } else if msg.get("upcall").is_some() {
                self.pending_upcalls.push_back(msg);
            } else {
                self.pending_responses.push_back(msg);
            }
        }
        None
    }

    async fn generate(&mut self) -> (String, String) {
        let success = self.call_ok(METHOD_GENERATE_KEYPAIR, json!({})).await;
        (
            success["sk"].as_str().unwrap().to_string(),
            success["peer_id"].as_str().unwrap().to_string(),
        )
    }

    async fn configure_ok(&mut self, body: Value) {
        self.call_ok(METHOD_CONFIGURE, body).await;
    }

    /// First listening address, polled until the listener has bound.
    async fn listening_addr(&mut self) -> String {
        for _ in 0..100 {
            let success = self.call_ok(METHOD_LISTENING_ADDRS, json!({})).await;
            let addrs = success.as_array().unwrap();
            if let Some(addr) = addrs.first() {
                return addr.as_str().unwrap().to_string();
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("helper never reported a listening address");
    }

    /// Poll `listPeers` until `peer_id` shows up among open connections.
    async fn wait_for_peer(&mut self, peer_id: &str) {
        for _ in 0..150 {
            let success = self.call_ok(METHOD_LIST_PEERS, json!({})).await;
            let connected = success
                .as_array()
                .unwrap()
                .iter()
                .any(|p| p["peer_id"] == peer_id);
            if connected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        panic!("never connected to {peer_id}");
    }
}

fn configure_body(statedir: &std::path::Path, sk: &str, network_id: &str) -> Value {
    json!({
        "statedir": statedir.to_str().unwrap(),
        "privk": sk,
        "network_id": network_id,
        "ifaces": ["/ip4/127.0.0.1/tcp/0"],
        "flood": true,
    })
}

/// Bring up a connected pair on `network_id`: B is seeded with A's address
/// and bootstraps its DHT against it.
async fn connected_pair(
    network_id: &str,
    dir_a: &std::path::Path,
    dir_b: &std::path::Path,
) -> (Helper, String, Helper, String) {
    let mut a = Helper::spawn();
    let mut b = Helper::spawn();
    let (a_sk, a_peer) = a.generate().await;
    let (b_sk, b_peer) = b.generate().await;

    a.configure_ok(configure_body(dir_a, &a_sk, network_id)).await;
    let a_addr = a.listening_addr().await;

    let mut body = configure_body(dir_b, &b_sk, network_id);
    body["seed_peers"] = json!([a_addr]);
    b.configure_ok(body).await;

    b.wait_for_peer(&a_peer).await;
    a.wait_for_peer(&b_peer).await;
    (a, a_peer, b, b_peer)
}

#[tokio::test]
async fn gossip_publish_triggers_validate_on_the_subscriber() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (mut a, _a_peer, mut b, b_peer) =
        connected_pair("itest-pubsub", dir_a.path(), dir_b.path()).await;

    a.call_ok(METHOD_SUBSCRIBE, json!({"topic": "x", "subscription_idx": 7}))
        .await;
    b.call_ok(METHOD_SUBSCRIBE, json!({"topic": "x", "subscription_idx": 1}))
        .await;

    // Subscription state travels with gossipsub heartbeats; retry the
    // publish with fresh payloads until one lands on A.
    let mut validate = None;
    for attempt in 0..30u32 {
        let payload = encode_b64(format!("hello-{attempt}").as_bytes());
        let response = b
            .call(METHOD_PUBLISH, json!({"topic": "x", "data": payload}))
            .await;
        if response.get("error").is_some() {
            // No gossip peers yet.
            tokio::time::sleep(Duration::from_millis(500)).await;
            continue;
        }
        if let Some(up) = a.upcall_within("validate", Duration::from_secs(2)).await {
            validate = Some(up);
            break;
        }
    }
    let validate = validate.expect("subscriber never received a validate upcall");

    assert_eq!(validate["subscription_idx"], 7);
    assert_eq!(validate["sender"]["peer_id"], b_peer);
    assert_eq!(validate["sender"]["host"], "127.0.0.1");
    let data = decode_b64(validate["data"].as_str().unwrap()).unwrap();
    assert!(data.starts_with(b"hello-"), "unexpected payload {data:?}");

    // Answering the ticket resolves the pending gossipsub validation.
    let ticket = validate["seqno"].as_u64().unwrap();
    a.call_ok(
        METHOD_VALIDATION_COMPLETE,
        json!({"seqno": ticket, "is_valid": "accept"}),
    )
    .await;

    // The ticket is gone now: answering again is an error.
    let response = a
        .call(
            METHOD_VALIDATION_COMPLETE,
            json!({"seqno": ticket, "is_valid": "accept"}),
        )
        .await;
    assert_eq!(
        response["error"],
        "internal RPC error: validation seqno unknown"
    );
}

#[tokio::test]
async fn stream_bytes_arrive_in_order_then_complete_on_close() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (mut a, a_peer, mut b, _b_peer) =
        connected_pair("itest-stream", dir_a.path(), dir_b.path()).await;

    a.call_ok(METHOD_ADD_STREAM_HANDLER, json!({"protocol": "/itest/echo/1"}))
        .await;

    let opened = b
        .call_ok(
            METHOD_OPEN_STREAM,
            json!({"peer": a_peer, "protocol": "/itest/echo/1"}),
        )
        .await;
    let b_idx = opened["stream_idx"].as_u64().unwrap();
    assert_eq!(opened["peer"]["peer_id"], a_peer);

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    b.call_ok(
        METHOD_SEND_STREAM_MSG,
        json!({"stream_idx": b_idx, "data": encode_b64(&payload)}),
    )
    .await;

    let incoming = a
        .upcall_within("incomingStream", IO_TIMEOUT)
        .await
        .expect("no incomingStream upcall");
    assert_eq!(incoming["protocol"], "/itest/echo/1");
    let a_idx = incoming["stream_idx"].as_u64().unwrap();

    // All data upcalls arrive in wire order; concatenated they must equal
    // the sent payload exactly.
    let mut collected = Vec::new();
    while collected.len() < payload.len() {
        let msg = a
            .upcall_within("incomingStreamMsg", IO_TIMEOUT)
            .await
            .expect("missing stream data");
        assert_eq!(msg["stream_idx"].as_u64().unwrap(), a_idx);
        collected.extend(decode_b64(msg["data"].as_str().unwrap()).unwrap());
    }
    assert_eq!(collected, payload);

    // Completion is only signaled once the writer half closes.
    b.call_ok(METHOD_CLOSE_STREAM, json!({"stream_idx": b_idx}))
        .await;
    let complete = a
        .upcall_within("streamReadComplete", IO_TIMEOUT)
        .await
        .expect("no streamReadComplete upcall");
    assert_eq!(complete["stream_idx"].as_u64().unwrap(), a_idx);
}

#[tokio::test]
async fn gating_denies_a_banned_peer_until_trusted() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let mut a = Helper::spawn();
    let mut b = Helper::spawn();
    let (a_sk, a_peer) = a.generate().await;
    let (b_sk, b_peer) = b.generate().await;

    // A bans B from the start.
    let mut body_a = configure_body(dir_a.path(), &a_sk, "itest-gate");
    body_a["gating_config"] = json!({"banned_peers": [b_peer]});
    a.configure_ok(body_a).await;
    a.call_ok(METHOD_ADD_STREAM_HANDLER, json!({"protocol": "/itest/gate/1"}))
        .await;
    let a_addr = a.listening_addr().await;

    let mut body_b = configure_body(dir_b.path(), &b_sk, "itest-gate");
    body_b["seed_peers"] = json!([a_addr]);
    b.configure_ok(body_b).await;

    let denied = b
        .call(
            METHOD_OPEN_STREAM,
            json!({"peer": a_peer, "protocol": "/itest/gate/1"}),
        )
        .await;
    let error = denied["error"].as_str().expect("gated openStream must fail");
    assert!(error.starts_with("libp2p error"), "{error}");

    // Trusted strictly overrides banned.
    a.call_ok(
        METHOD_SET_GATING_CONFIG,
        json!({"banned_peers": [b_peer], "trusted_peers": [b_peer]}),
    )
    .await;

    let mut opened = None;
    for _ in 0..10 {
        let response = b
            .call(
                METHOD_OPEN_STREAM,
                json!({"peer": a_peer, "protocol": "/itest/gate/1"}),
            )
            .await;
        if response.get("error").is_none() {
            opened = Some(response);
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let opened = opened.expect("trusted peer still gated");
    assert_eq!(opened["success"]["peer"]["peer_id"], a_peer);
}
