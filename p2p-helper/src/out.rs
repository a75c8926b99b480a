//! Outbound serialization.
//!
//! Every byte on stdout comes from one writer task draining one queue, which
//! makes the queue the ordering authority for responses and upcalls alike.
//! Messages are serialized to JSON before they are enqueued; the writer
//! appends the newline, batches whatever is already queued to cut syscalls,
//! and flushes. A write error is fatal to the process.

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::rpc::{ErrorResponse, RpcError, SuccessResponse, Upcall};

/// Outbound queue depth. Deep enough that bursts of stream reads do not
/// stall the swarm loop behind a slow host.
const QUEUE_CAPACITY: usize = 4096;

/// Cap on messages written between flushes.
const MAX_BATCH: usize = 64;

/// Handle for enqueueing outbound messages. Cheap to clone; every producer
/// (dispatcher, swarm loop, stream readers) holds one.
#[derive(Clone)]
pub struct OutboundSink {
    tx: mpsc::Sender<String>,
}

impl OutboundSink {
    pub async fn respond_ok(&self, seqno: u64, success: Value, elapsed: Duration) {
        let msg = SuccessResponse {
            seqno,
            success,
            duration: format!("{elapsed:?}"),
        };
        self.enqueue(serde_json::to_string(&msg)).await;
    }

    pub async fn respond_err(&self, seqno: u64, error: &RpcError) {
        let msg = ErrorResponse {
            seqno,
            error: error.to_string(),
        };
        self.enqueue(serde_json::to_string(&msg)).await;
    }

    pub async fn upcall(&self, upcall: Upcall) {
        self.enqueue(serde_json::to_string(&upcall)).await;
    }

    async fn enqueue(&self, serialized: serde_json::Result<String>) {
        match serialized {
            Ok(mut line) => {
                line.push('\n');
                // The receiver only goes away at process teardown.
                let _ = self.tx.send(line).await;
            }
            Err(e) => tracing::error!("failed to serialize outbound message: {e}"),
        }
    }
}

/// Spawn the writer task. Returns the sink producers write into and the
/// task handle; the task ends once every sink clone is dropped.
pub fn spawn_writer<W>(mut output: W) -> (OutboundSink, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = output.write_all(line.as_bytes()).await {
                tracing::error!("output write failed: {e}");
                std::process::exit(1);
            }
            // Drain whatever else is queued before paying for a flush.
            let mut batched = 0;
            while batched < MAX_BATCH {
                let Ok(queued) = rx.try_recv() else { break };
                if let Err(e) = output.write_all(queued.as_bytes()).await {
                    tracing::error!("output write failed: {e}");
                    std::process::exit(1);
                }
                batched += 1;
            }
            if let Err(e) = output.flush().await {
                tracing::error!("output flush failed: {e}");
                std::process::exit(1);
            }
        }
        let _ = output.flush().await;
    });
    (OutboundSink { tx }, handle)
}
