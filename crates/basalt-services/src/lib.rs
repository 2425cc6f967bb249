//! basalt-services — the datanode side of the block transfer protocol:
//! replica storage, access tokens, throttling and the per-connection
//! operation handlers.

pub mod client;
pub mod delta;
pub mod error;
pub mod node;
pub mod pipeline;
pub mod proxy;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod storage;
pub mod throttle;
pub mod token;
pub mod xceiver;

pub use client::PeerConnection;
pub use error::TransferError;
pub use node::{BlockAnnouncer, LogAnnouncer, NodeContext};
pub use server::XferServer;
pub use storage::{BlockStore, FsBlockStore, ReplicaState};
pub use throttle::BalanceThrottler;
pub use token::{AccessGuard, BlockTokenSecretManager, TokenVerifier};
