//! Command dispatch.
//!
//! A single reader consumes envelopes from the input pipe and spawns one
//! task per request, so a handler blocked on the network never stalls the
//! pipe. Protocol violations (unreadable JSON, an unknown method tag) are
//! fatal: the helper terminates and the host is expected to restart it.
//! Handler panics are caught here, logged, and also terminate the process.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};

use crate::keys;
use crate::node::{Node, NodeConfig};
use crate::out::{self, OutboundSink};
use crate::rpc::{Envelope, Request, RpcError};
use crate::seqs::SequenceSource;

/// Drive the helper over a pair of byte streams. `run` returns when the
/// input side reaches EOF; background work keeps flowing to the output
/// until the process ends.
pub async fn run<R, W>(input: R, output: W) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (sink, _writer) = out::spawn_writer(output);
    let service = Arc::new(Service::new(sink.clone()));

    let mut reader = BufReader::new(input);
    // Lines can be huge: a 16 MiB payload inflates past 21 MiB as base64.
    // The buffer grows as needed and is reused across requests.
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .context("reading command pipe")?;
        if n == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: Envelope =
            serde_json::from_str(trimmed).context("malformed request envelope")?;
        let request = Request::decode(envelope.method, envelope.body)
            .with_context(|| format!("request seqno {}", envelope.seqno))?;

        let seqno = envelope.seqno;
        let service = service.clone();
        let sink = sink.clone();
        tokio::spawn(async move {
            let method = request.name();
            let started = Instant::now();
            match AssertUnwindSafe(service.handle(request)).catch_unwind().await {
                Ok(Ok(success)) => sink.respond_ok(seqno, success, started.elapsed()).await,
                Ok(Err(error)) => {
                    tracing::debug!(method, seqno, %error, "request failed");
                    sink.respond_err(seqno, &error).await;
                }
                Err(_panic) => {
                    tracing::error!(method, seqno, "handler panicked, terminating");
                    std::process::exit(2);
                }
            }
        });
    }
    tracing::info!("command pipe closed");
    Ok(())
}

/// Per-process handler state: the sequence source, the outbound sink, and,
/// after a successful `configure`, the node.
pub struct Service {
    seqs: Arc<SequenceSource>,
    out: OutboundSink,
    node: Mutex<Option<Arc<Node>>>,
}

impl Service {
    pub fn new(out: OutboundSink) -> Self {
        Service {
            seqs: Arc::new(SequenceSource::new()),
            out,
            node: Mutex::new(None),
        }
    }

    fn node(&self) -> Result<Arc<Node>, RpcError> {
        self.node
            .lock()
            .clone()
            .ok_or_else(|| RpcError::internal("helper not yet configured"))
    }

    async fn configure(&self, body: crate::rpc::ConfigureBody) -> Result<Value, RpcError> {
        if self.node.lock().is_some() {
            return Err(RpcError::internal("helper already configured"));
        }
        let config = NodeConfig::from_rpc(body)?;
        let node = Node::spawn(config, self.out.clone(), self.seqs.clone())?;
        tracing::info!(peer_id = %node.local_peer_id(), "configured");
        let mut slot = self.node.lock();
        if slot.is_some() {
            return Err(RpcError::internal("helper already configured"));
        }
        *slot = Some(node);
        Ok(json!({}))
    }

    /// Route one request to its handler. Everything except `configure` and
    /// `generateKeypair` requires the node.
    pub async fn handle(&self, request: Request) -> Result<Value, RpcError> {
        match request {
            Request::Configure(body) => self.configure(body).await,
            Request::GenerateKeypair => serde_json::to_value(keys::generate()?)
                .map_err(|e| RpcError::internal(e.to_string())),
            Request::Listen(body) => self.node()?.listen(&body.iface).await,
            Request::ListeningAddrs => self.node()?.listening_addrs().await,
            Request::Publish(body) => self.node()?.publish(&body.topic, &body.data).await,
            Request::Subscribe(body) => {
                self.node()?
                    .subscribe(&body.topic, body.subscription_idx)
                    .await
            }
            Request::Unsubscribe(body) => self.node()?.unsubscribe(body.subscription_idx).await,
            Request::ValidationComplete(body) => {
                self.node()?.validation_complete(body.seqno, body.is_valid)
            }
            Request::OpenStream(body) => {
                self.node()?.open_stream(&body.peer, &body.protocol).await
            }
            Request::CloseStream(body) => self.node()?.close_stream(body.stream_idx).await,
            Request::ResetStream(body) => self.node()?.reset_stream(body.stream_idx),
            Request::SendStreamMsg(body) => {
                self.node()?
                    .send_stream_msg(body.stream_idx, &body.data)
                    .await
            }
            Request::AddStreamHandler(body) => self.node()?.add_stream_handler(&body.protocol),
            Request::RemoveStreamHandler(body) => {
                self.node()?.remove_stream_handler(&body.protocol)
            }
            Request::BeginAdvertising => self.node()?.begin_advertising().await,
            Request::FindPeer(body) => self.node()?.find_peer(&body.peer_id),
            Request::ListPeers => self.node()?.list_peers(),
            Request::SetGatingConfig(config) => self.node()?.set_gating_config(&config),
            // Kept wire-compatible: the host expects this exact failure.
            Request::AddPeer(_) => Err(RpcError::internal(
                "addPeer disabled: seed peer rebootstrap needs reimplementation",
            )),
        }
    }
}
