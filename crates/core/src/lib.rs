//! Core model for patroni-lb.
//!
//! Turns the mirrored membership subtree of a Patroni scope into a
//! deterministic HAProxy configuration:
//!
//! - [`tree::TreeNode`] - in-memory mirror of a coordination-store subtree
//! - [`record`] - decodes one member's JSON payload into a [`record::MemberRecord`]
//! - [`snapshot`] - validates the members and derives a [`snapshot::ClusterSnapshot`]
//! - [`render`] - renders a snapshot into a [`render::RenderedConfig`]
//! - [`config`] - daemon configuration shared by all crates
//!
//! Nothing in this crate talks to the coordination store or the managed
//! process. Decoding, snapshot building and rendering are pure.

pub mod config;
pub mod error;
pub mod record;
pub mod render;
pub mod snapshot;
pub mod tree;

pub use config::LbConfig;
pub use error::{Error, Result};
pub use record::{decode, DecodeError, HostPort, MemberRecord, MemberState, Role};
pub use render::{render, HealthCheck, RenderSettings, RenderedConfig};
pub use snapshot::{build_snapshot, Backend, ClusterSnapshot, SnapshotError};
pub use tree::{join_path, TreeNode};
