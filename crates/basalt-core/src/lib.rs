//! basalt-core — wire format, protocol messages, checksums and config.
//! All other Basalt crates depend on this one.

pub mod checksum;
pub mod codec;
pub mod config;
pub mod message;
pub mod wire;

pub use codec::Packet;
pub use config::NodeConfig;
pub use message::{BlockIdentity, BlockOpResponse, Request};
pub use wire::{Op, Status, WireError};
