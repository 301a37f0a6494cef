mod log_store;
mod messages;
mod network;
mod peer;
mod raft_node;
mod snapshot;
mod state_machine;
mod storage;

pub use log_store::*;
pub use messages::*;
pub use network::*;
pub use raft_node::RaftServer;
pub use snapshot::*;
pub use state_machine::*;
pub use storage::*;
