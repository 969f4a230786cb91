//! # raft-node
//!
//! why: run the raft protocol on top of raft-core's types and raft-storage's durable log
//! relations: embedders supply a RaftTransport and a StateMachine, and route inbound rpcs through RaftService
//! what: RaftNode event loop, peers, NodeHandle, RaftService, RaftError
//!
//! each node is a single tokio task fed by one unbounded queue. peers spawn
//! their rpcs and post the replies back onto that queue, so the protocol
//! state never needs a lock.

pub mod error;
pub mod event;
pub mod handle;
pub mod node;
pub mod peer;
pub mod service;
pub mod transport;

pub use error::RaftError;
pub use event::{NodeEvent, Reply};
pub use handle::NodeHandle;
pub use node::RaftNode;
pub use service::RaftService;
pub use transport::{PeerInfo, RaftTransport};
