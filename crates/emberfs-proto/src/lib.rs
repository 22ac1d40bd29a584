#![warn(missing_docs)]

//! Wire protocol for the EmberFS FUSE metadata broker.
//!
//! Defines the request, heartbeat and response message types exchanged
//! between FUSE client mounts and the metadata broker, the bincode codec,
//! and the hex-length frame header used when several container messages are
//! streamed in response to a single listing.

pub mod heartbeat;
pub mod md;
pub mod response;
pub mod wire;

pub use heartbeat::{Heartbeat, Statistics};
pub use md::{Flock, LockKind, MdOperation, MdRequest};
pub use response::{
    Ack, AckCode, CapRecord, Config, Container, ContainerKind, Dentry, DentryKind, Evict,
    LeaseKind, LeaseMsg, LockResponse, MdRecord, MdRecordKind, QuotaInfo, Response,
};
pub use wire::{
    deserialize_message, frame, frame_header, serialize_message, split_frames, ProtoError,
    RequestEnvelope,
};

/// Protocol version spoken by this broker.
pub const PROTOCOL_VERSION: u32 = 3;

/// Oldest client protocol version still accepted; older clients are evicted.
pub const MIN_PROTOCOL_VERSION: u32 = 2;
