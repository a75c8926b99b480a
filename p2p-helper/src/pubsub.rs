//! Gossip subscriptions and the host-supervised validator bridge.
//!
//! Every inbound gossip message is held by gossipsub until the helper
//! reports a verdict. The helper forwards the message to the host as a
//! `validate` upcall carrying a ticket seqno, and parks a waiter on a
//! per-ticket oneshot channel. The host answers with `validationComplete`;
//! if it does not answer within the deadline the waiter reports a fallback
//! verdict but the ticket deliberately stays in the table, so a late answer
//! is still accepted (and logged with its latency) rather than erroring.

use std::collections::HashMap;
use std::time::Instant;

use libp2p::gossipsub::{MessageAcceptance, TopicHash};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::rpc::RpcError;

/// Host verdict on a gossip message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Accept,
    Reject,
    Ignore,
}

impl Verdict {
    pub fn acceptance(self) -> MessageAcceptance {
        match self {
            Verdict::Accept => MessageAcceptance::Accept,
            Verdict::Reject => MessageAcceptance::Reject,
            Verdict::Ignore => MessageAcceptance::Ignore,
        }
    }
}

struct Ticket {
    tx: oneshot::Sender<Verdict>,
    created_at: Instant,
    timed_out_at: Option<Instant>,
}

/// Outstanding validation tickets, keyed by seqno.
#[derive(Default)]
pub struct ValidatorTable {
    tickets: Mutex<HashMap<u64, Ticket>>,
}

impl ValidatorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ticket and hand back the channel its waiter blocks on.
    pub fn insert(&self, seqno: u64) -> oneshot::Receiver<Verdict> {
        let (tx, rx) = oneshot::channel();
        self.tickets.lock().insert(
            seqno,
            Ticket {
                tx,
                created_at: Instant::now(),
                timed_out_at: None,
            },
        );
        rx
    }

    /// Deliver the host's verdict. Removes the ticket; unknown seqnos are an
    /// RPC error. Late answers (after the libp2p-side timeout already
    /// reported a fallback) are accepted and logged.
    pub fn complete(&self, seqno: u64, verdict: Verdict) -> Result<(), RpcError> {
        let ticket = self
            .tickets
            .lock()
            .remove(&seqno)
            .ok_or_else(|| RpcError::internal("validation seqno unknown"))?;
        if let Some(timed_out_at) = ticket.timed_out_at {
            tracing::info!(
                seqno,
                late_by = ?timed_out_at.elapsed(),
                total = ?ticket.created_at.elapsed(),
                "validation answered after timeout"
            );
        }
        // The waiter may itself have gone away after its timeout; the
        // verdict was already reported then, so a dead channel is fine.
        let _ = ticket.tx.send(verdict);
        Ok(())
    }

    /// Record that the libp2p-side deadline fired. The ticket stays.
    pub fn mark_timed_out(&self, seqno: u64) {
        if let Some(ticket) = self.tickets.lock().get_mut(&seqno) {
            ticket.timed_out_at = Some(Instant::now());
        }
    }

    /// Drop a ticket without an answer (sender could not be resolved).
    pub fn discard(&self, seqno: u64) {
        self.tickets.lock().remove(&seqno);
    }

    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}

/// A live gossip subscription.
pub struct SubEntry {
    pub topic: String,
    pub hash: TopicHash,
}

/// Subscriptions keyed by the host-chosen index.
#[derive(Default)]
pub struct Subscriptions {
    entries: HashMap<u64, SubEntry>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; fails if the index is already taken.
    pub fn insert(&mut self, idx: u64, topic: String, hash: TopicHash) -> bool {
        if self.entries.contains_key(&idx) {
            return false;
        }
        self.entries.insert(idx, SubEntry { topic, hash });
        true
    }

    pub fn remove(&mut self, idx: u64) -> Option<SubEntry> {
        self.entries.remove(&idx)
    }

    /// Subscription index consuming messages on a topic.
    pub fn idx_for(&self, hash: &TopicHash) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, e)| e.hash == *hash)
            .map(|(idx, _)| *idx)
    }

    /// Whether any remaining subscription still uses a topic.
    pub fn topic_in_use(&self, hash: &TopicHash) -> bool {
        self.entries.values().any(|e| e.hash == *hash)
    }
}
