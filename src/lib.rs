pub mod api;
pub mod config;
pub mod daemon;
pub mod error;
pub mod raft_api;
pub mod replicator;
pub mod testing;
pub mod types;

pub use api::create_router;
pub use config::{NodeConfig, RaftSettings};
pub use daemon::FlockDaemon;
pub use error::{RaftError, TransportError};
pub use raft_api::create_raft_router;
pub use replicator::{RaftServer, StateMachine, Transporter};
pub use types::*;
