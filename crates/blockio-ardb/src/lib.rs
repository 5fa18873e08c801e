//! blockio ARDB client - cluster routing and wire plumbing
//!
//! This crate implements the data plane's path to the ARDB storage
//! servers:
//! - RESP wire codec and typed reply decoders
//! - connections, dialing and a bounded connection pool
//! - deterministic server routing (modulo + jump-consistent hashing)
//! - the cluster flavors, including config-supervised primary and
//!   template clusters

pub mod cluster;
pub mod command;
pub mod conn;
pub mod decode;
pub mod pool;
pub mod resp;
pub mod routing;
pub mod supervised;

pub use cluster::{Cluster, IndexActionPair, StorageServer};
pub use command::{op, Action, Command, CommandArg};
pub use conn::{Connection, Dialer, StandardDialer, DEFAULT_DIAL_TIMEOUT};
pub use pool::{Pool, PooledConnection, DEFAULT_MAX_IDLE_PER_SERVER};
pub use resp::Value;
pub use routing::{compute_server_index, find_first_server_index};
pub use supervised::{PrimaryCluster, TemplateCluster};
