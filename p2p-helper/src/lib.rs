//! Peer-to-peer network helper.
//!
//! A long-running child process that owns all libp2p networking on behalf of
//! a host application. The host drives it over a line-delimited JSON
//! request/response channel on stdin/stdout; unsolicited events flow back as
//! "upcalls" on the same output pipe. Structured logs go to stderr.
//!
//! The crate is split along the seams of that bridge:
//! - [`rpc`]: wire types (envelopes, request bodies, responses, upcalls)
//! - [`dispatch`]: the single input reader and the per-request handlers
//! - [`out`]: the single output writer that serializes responses and upcalls
//! - [`node`]: the libp2p swarm (transport, behaviour, and its event loop)
//! - [`gating`]: mutable allow/deny policy applied at connection checkpoints
//! - [`pubsub`]: gossip subscriptions and the host-supervised validator
//! - [`streams`]: registry of application streams and their reader tasks
//! - [`keys`]: identity generation and key (de)serialization
//! - [`seqs`]: the process-wide monotonic sequence source

pub mod dispatch;
pub mod gating;
pub mod keys;
pub mod node;
pub mod out;
pub mod pubsub;
pub mod rpc;
pub mod seqs;
pub mod streams;
