//! # Fabricview - Network Fabric Analytics API
//!
//! Fabricview is a read-only analytical HTTP API over a network fabric. It
//! answers operational questions about devices, links, metros, contributors
//! and Solana validators by querying two backing stores: a property graph
//! holding the IS-IS topology and a columnar analytical database holding
//! telemetry facts, dimensional history and snapshot tables.
//!
//! ## Architecture
//!
//! Fabricview uses a layered architecture:
//! - **Store Layer**: thin parameterized query clients for the graph store
//!   (`graph`) and the columnar store (`columnar`), with retry, value
//!   coercion and NaN sanitization.
//! - **Query Layer**: topology analytics (paths, impact, redundancy), the
//!   composite status builder and the history bucketizer (`query`).
//! - **Timeline Layer**: the multi-source event merge engine (`timeline`).
//! - **API Layer**: axum HTTP surface plus the refresh cache that serves
//!   precomputed composites for default requests (`server`, `cache`).
//!
//! The service never writes to either store.

pub mod cache;
pub mod columnar;
pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod metrics;
pub mod model;
pub mod query;
pub mod server;
pub mod timeline;

// Re-export the main public API
pub use crate::config::Config;
pub use crate::error::{FabricError, Result};
pub use crate::model::{Device, HealthState, Link, LinkStatus};
pub use crate::timeline::event::{generate_event_id, TimelineEvent};
