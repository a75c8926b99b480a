//! Registry of application streams.
//!
//! Each open stream gets an index from the sequence source and a dedicated
//! reader task that forwards wire data to the host as upcalls. The table
//! mutex is held only across insert/lookup/delete, never across I/O; writes
//! go through a per-stream async mutex instead.
//!
//! Stream lifecycle: open (local dial or inbound accept) → reads/writes →
//! `closeStream` (half-close, the entry stays until the remote side closes),
//! `resetStream` (hard abort, entry removed immediately), or remote EOF.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::out::OutboundSink;
use crate::rpc::{PeerInfo, RpcError, Upcall, encode_b64};

/// Fixed reader buffer; each non-empty read becomes one upcall.
const READ_BUF_SIZE: usize = 4096;

/// Delay before an `openStream` reader starts, so the host sees the open
/// response before the first `incomingStreamMsg` for that stream.
pub const OPEN_STREAM_READER_DELAY: Duration = Duration::from_millis(250);

struct StreamEntry<S> {
    info: PeerInfo,
    protocol: String,
    writer: Arc<tokio::sync::Mutex<WriteHalf<S>>>,
    reader: JoinHandle<()>,
}

/// Table of live application streams, generic over the duplex byte stream
/// so tests can drive it without a network.
pub struct StreamRegistry<S> {
    streams: Mutex<HashMap<u64, StreamEntry<S>>>,
    out: OutboundSink,
}

impl<S> StreamRegistry<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    pub fn new(out: OutboundSink) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            out,
        }
    }

    /// Register a stream and start its reader. `delay` is set for locally
    /// opened streams so the open response wins the race against the first
    /// data upcall.
    pub fn insert(
        &self,
        idx: u64,
        info: PeerInfo,
        protocol: String,
        stream: S,
        delay: Option<Duration>,
    ) {
        let (read_half, write_half) = stream.split();
        let reader = spawn_reader(idx, read_half, self.out.clone(), delay);
        let entry = StreamEntry {
            info,
            protocol,
            writer: Arc::new(tokio::sync::Mutex::new(write_half)),
            reader,
        };
        if self.streams.lock().insert(idx, entry).is_some() {
            // Indices come from the sequence source and are never reused.
            tracing::error!(stream_idx = idx, "stream index collision");
        }
    }

    /// Write the whole payload. A short write is surfaced with the byte
    /// count that actually went out.
    pub async fn send(&self, idx: u64, data: &[u8]) -> Result<(), RpcError> {
        let writer = self.writer_of(idx)?;
        let mut writer = writer.lock().await;
        let mut written = 0;
        while written < data.len() {
            match writer.write(&data[written..]).await {
                Ok(0) => {
                    return Err(RpcError::internal(format!(
                        "short write: {written} of {} bytes",
                        data.len()
                    )));
                }
                Ok(n) => written += n,
                Err(e) => {
                    return Err(RpcError::Libp2p(format!(
                        "stream write failed after {written} of {} bytes: {e}",
                        data.len()
                    )));
                }
            }
        }
        writer
            .flush()
            .await
            .map_err(|e| RpcError::Libp2p(format!("stream flush failed: {e}")))
    }

    /// Half-close for writes. The entry stays and the reader keeps running
    /// until the remote half closes.
    pub async fn close(&self, idx: u64) -> Result<(), RpcError> {
        let writer = self.writer_of(idx)?;
        let mut writer = writer.lock().await;
        writer
            .close()
            .await
            .map_err(|e| RpcError::Libp2p(format!("stream close failed: {e}")))
    }

    /// Hard abort in both directions; the entry is removed immediately.
    pub fn reset(&self, idx: u64) -> Result<(), RpcError> {
        let entry = self
            .streams
            .lock()
            .remove(&idx)
            .ok_or_else(|| unknown_stream(idx))?;
        entry.reader.abort();
        // Dropping both halves resets the underlying stream.
        Ok(())
    }

    pub fn info(&self, idx: u64) -> Option<(PeerInfo, String)> {
        self.streams
            .lock()
            .get(&idx)
            .map(|e| (e.info.clone(), e.protocol.clone()))
    }

    fn writer_of(&self, idx: u64) -> Result<Arc<tokio::sync::Mutex<WriteHalf<S>>>, RpcError> {
        self.streams
            .lock()
            .get(&idx)
            .map(|e| e.writer.clone())
            .ok_or_else(|| unknown_stream(idx))
    }
}

fn unknown_stream(idx: u64) -> RpcError {
    RpcError::internal(format!("unknown stream_idx {idx}"))
}

/// Per-stream reader loop. Emits `incomingStreamMsg` for each non-empty
/// read in wire order, then exactly one of `streamReadComplete` (EOF) or
/// `streamLost` (read error). Never retries.
fn spawn_reader<R>(
    idx: u64,
    mut reader: ReadHalf<R>,
    out: OutboundSink,
    delay: Option<Duration>,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    out.upcall(Upcall::StreamReadComplete { stream_idx: idx }).await;
                    break;
                }
                Ok(n) => {
                    out.upcall(Upcall::IncomingStreamMsg {
                        stream_idx: idx,
                        data: encode_b64(&buf[..n]),
                    })
                    .await;
                }
                Err(e) => {
                    out.upcall(Upcall::StreamLost {
                        stream_idx: idx,
                        reason: e.to_string(),
                    })
                    .await;
                    break;
                }
            }
        }
        tracing::debug!(stream_idx = idx, "stream reader exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::out::spawn_writer;
    use crate::rpc::decode_b64;
    use futures::task::{Context, Poll};
    use libp2p::PeerId;
    use serde_json::Value;
    use std::pin::Pin;
    use tokio::io::AsyncBufReadExt;

    /// In-memory duplex that yields a fixed payload, then EOF, and swallows
    /// writes. Enough to drive the registry without a network.
    struct ScriptedStream {
        data: std::io::Cursor<Vec<u8>>,
        fail_write_after: Option<usize>,
        written: usize,
    }

    impl ScriptedStream {
        fn with_payload(data: Vec<u8>) -> Self {
            Self {
                data: std::io::Cursor::new(data),
                fail_write_after: None,
                written: 0,
            }
        }

        fn failing_writes_after(limit: usize) -> Self {
            Self {
                data: std::io::Cursor::new(Vec::new()),
                fail_write_after: Some(limit),
                written: 0,
            }
        }
    }

    impl AsyncRead for ScriptedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut [u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = std::io::Read::read(&mut self.data, buf)?;
            Poll::Ready(Ok(n))
        }
    }

    impl AsyncWrite for ScriptedStream {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if let Some(limit) = self.fail_write_after {
                let remaining = limit.saturating_sub(self.written);
                if remaining == 0 {
                    return Poll::Ready(Err(std::io::Error::other("peer reset")));
                }
                let n = remaining.min(buf.len());
                self.written += n;
                return Poll::Ready(Ok(n));
            }
            self.written += buf.len();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn test_info() -> PeerInfo {
        PeerInfo::loopback(&PeerId::random())
    }

    async fn next_upcall(
        lines: &mut tokio::io::Lines<tokio::io::BufReader<tokio::io::DuplexStream>>,
    ) -> Value {
        serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn reader_forwards_data_in_order_then_completes() {
        let (client, server) = tokio::io::duplex(65536);
        let (sink, _task) = spawn_writer(server);
        let registry = StreamRegistry::new(sink);

        // Payload longer than the read buffer so it arrives as several
        // upcalls whose concatenation must equal the original bytes.
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        registry.insert(
            5,
            test_info(),
            "/test/1".into(),
            ScriptedStream::with_payload(payload.clone()),
            None,
        );

        let mut lines = tokio::io::BufReader::new(client).lines();
        let mut collected = Vec::new();
        loop {
            let up = next_upcall(&mut lines).await;
            match up["upcall"].as_str().unwrap() {
                "incomingStreamMsg" => {
                    assert_eq!(up["stream_idx"], 5);
                    collected.extend(decode_b64(up["data"].as_str().unwrap()).unwrap());
                }
                "streamReadComplete" => {
                    assert_eq!(up["stream_idx"], 5);
                    break;
                }
                other => panic!("unexpected upcall {other}"),
            }
        }
        assert_eq!(collected, payload);
    }

    #[tokio::test]
    async fn send_reports_short_writes() {
        let (_client, server) = tokio::io::duplex(65536);
        let (sink, _task) = spawn_writer(server);
        let registry = StreamRegistry::new(sink);
        registry.insert(
            1,
            test_info(),
            "/test/1".into(),
            ScriptedStream::failing_writes_after(10),
            None,
        );

        let err = registry.send(1, &[0u8; 64]).await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("libp2p error"), "{msg}");
        assert!(msg.contains("10 of 64 bytes"), "{msg}");
    }

    #[tokio::test]
    async fn unknown_stream_index_is_an_rpc_error() {
        let (_client, server) = tokio::io::duplex(1024);
        let (sink, _task) = spawn_writer(server);
        let registry: StreamRegistry<ScriptedStream> = StreamRegistry::new(sink);

        let err = registry.send(42, b"x").await.unwrap_err();
        assert_eq!(err.to_string(), "internal RPC error: unknown stream_idx 42");
        assert!(registry.reset(42).is_err());
    }

    #[tokio::test]
    async fn reset_removes_the_entry_close_does_not() {
        let (_client, server) = tokio::io::duplex(65536);
        let (sink, _task) = spawn_writer(server);
        let registry = StreamRegistry::new(sink);
        registry.insert(
            2,
            test_info(),
            "/test/1".into(),
            ScriptedStream::with_payload(Vec::new()),
            None,
        );

        registry.close(2).await.unwrap();
        assert!(registry.info(2).is_some(), "close keeps the entry");

        registry.reset(2).unwrap();
        assert!(registry.info(2).is_none(), "reset removes the entry");
    }
}
