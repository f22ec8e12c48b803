//! # libcsi — CSI over QUIC for MeshFS
//!
//! `libcsi` implements a [Container Storage Interface][csi] storage plugin
//! for MeshFS-backed volumes, using QUIC (via [`quinn`]) as the RPC
//! transport (Tokio async runtime, `tracing` for observability, `thiserror`
//! for structured errors).
//!
//! The heart of the crate is the pair of lifecycle state machines the CSI
//! contract demands: the Controller's volume provisioning machine
//! (`Creating → Created → Attached ⇄ Created → Deleting`) and the Node's
//! mount machine (`Unstaged → Staged → Published → Staged → Unstaged`).
//! Both are idempotent under at-least-once RPC delivery, serialize
//! same-volume operations through a per-key lock arena, and reconcile their
//! records against backend state when retried after a crash.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`types`] | Core data model: `Volume`, `VolumeId`, capabilities, requests. |
//! | [`error`] | [`CsiError`] enum and the canonical status [`Code`](error::Code) taxonomy. |
//! | [`message`] | [`CsiMessage`] protocol envelope for QUIC transport. |
//! | [`identity`] | [`CsiIdentity`] trait — plugin discovery & readiness. |
//! | [`controller`] | [`CsiController`] trait and the volume provisioning state machine. |
//! | [`node`] | [`CsiNode`] trait and the mount lifecycle state machine. |
//! | [`driver`] | [`Driver`](driver::Driver) composition root and process-wide identity. |
//! | [`lock`] | Per-volume lock arena shared by both state machines. |
//! | [`transport`] | QUIC client/server built on `quinn`. |
//! | [`backend`] | Storage backend boundary (MeshFS, in-memory). |
//!
//! [csi]: https://github.com/container-storage-interface/spec

pub mod backend;
pub mod controller;
pub mod driver;
pub mod error;
pub mod identity;
pub mod lock;
pub mod message;
pub mod node;
pub mod transport;
pub mod types;

// Re-export the most commonly used items at crate root for convenience.
pub use backend::StorageBackend;
pub use controller::CsiController;
pub use driver::{Driver, DriverConfig, DriverState};
pub use error::CsiError;
pub use identity::CsiIdentity;
pub use message::CsiMessage;
pub use node::CsiNode;
pub use types::*;
