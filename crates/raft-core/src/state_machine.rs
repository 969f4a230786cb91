//! # state_machine
//!
//! why: let the embedding application own the replicated state
//! relations: driven by raft-node's RaftNode, which applies committed entries in index order
//! what: StateMachine trait (role notification, snapshot save/load, entry application)

use crate::error::StateMachineError;
use crate::node::{LogIndex, NodeState};

/// Application callbacks invoked by a raft node.
///
/// All calls come from the node's single event task, so implementations never
/// see two calls at once. Any error returned here stops the node.
pub trait StateMachine: Send {
    /// Called after every role transition
    fn on_state_changed(&mut self, state: NodeState);

    /// Serialize the state reached after the last applied entry
    fn save_snapshot(&mut self) -> Result<Vec<u8>, StateMachineError>;

    /// Replace the whole state with a previously saved snapshot
    fn load_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError>;

    /// Apply one committed entry; indices arrive strictly increasing
    fn apply_entry(&mut self, index: LogIndex, data: &[u8]) -> Result<(), StateMachineError>;
}
