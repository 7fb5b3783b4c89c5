//! Nexus Core
//!
//! Peer directory, merge engine, gossip protocol and startup sequence for
//! Nexus nodes.

pub mod bootstrap;
pub mod config;
pub mod context;
pub mod identity;
pub mod nat;
pub mod nexus;
pub mod peer;
pub mod protocol;
pub mod public_addr;
pub mod runtime;
pub mod store;
pub mod tapsync;

pub use bootstrap::{bootstrap, BootstrapOptions, BootstrapOutcome, SeedInput};
pub use config::{Config, ConfigError};
pub use context::NodeContext;
pub use identity::{IdentityError, NodeIdentity};
pub use nat::NatError;
pub use nexus::NexusListener;
pub use peer::{merge, PeerDirectory, PeerRecord, Role};
pub use protocol::{fetch_peer_list, Command, ProtocolError};
pub use public_addr::{PublicAddressResolver, PublicAddresses};
pub use runtime::{run_node, NodeError};
pub use store::{PeerStore, StoreError};
pub use tapsync::{tap_sync, SyncVia, TapSyncOutcome};
