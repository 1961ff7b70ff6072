//! Common types shared across strata's tiers.

pub mod config;
pub mod error;
pub mod types;

pub use config::{load_config, AuthConfig, ProxyConfig, StorageConfig};
pub use error::{Error, Result};
pub use types::{Permission, Role};

/// Upper bound for a single RPC message, applied symmetrically to
/// encoding and decoding on every channel.
pub const MAX_TRANSPORT_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound for a single one-shot storage read. Clients page through
/// larger objects by advancing `start`.
pub const MAX_READ_SIZE: u64 = 8 * 1024 * 1024;

/// Interval at which storage servers re-announce their group membership.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;
