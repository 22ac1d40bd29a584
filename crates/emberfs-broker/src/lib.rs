#![warn(missing_docs)]

//! EmberFS metadata broker.
//!
//! The broker lets many concurrent FUSE client mounts share a single POSIX
//! namespace with strong consistency: it registers client sessions, issues
//! capabilities (permission leases pinned to inodes), tracks byte-range
//! locks and flush windows, dispatches metadata requests, and broadcasts
//! targeted invalidations to every other mount that caches affected state.

pub mod acl;
pub mod broadcast;
pub mod caps;
pub mod config;
pub mod dispatcher;
pub mod flush;
pub mod locks;
pub mod monitor;
pub mod namespace;
pub mod permissions;
pub mod quota;
pub mod registry;
pub mod service;
pub mod transport;
pub mod types;

pub use config::BrokerConfig;
pub use dispatcher::Dispatcher;
pub use service::BrokerService;
pub use types::{BrokerError, CapMode, InodeId, Result, Timestamp, VirtualIdentity};
