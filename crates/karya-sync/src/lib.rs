//! # Karya Sync
//!
//! A ready-to-run sync node for the Karya crowdsourcing platform.
//!
//! ## Overview
//!
//! Karya keeps worker phones, offline-capable edge boxes and the central
//! server in sync. Tasks and microtasks flow down from the server; worker
//! records, assignments and recorded files flow back up. Every tier runs
//! the same engine with a different [`Tier`](karya_sync_core::Tier).
//!
//! This crate wires the component crates into a [`Node`]:
//!
//! - **Store**: a SQLite database holding records, watermarks and peers
//! - **Files**: an attachment directory with checksum-verified contents
//! - **Orchestrator**: runs sync cycles against upstream peers
//! - **Endpoint**: answers the calls of downstream peers
//!
//! ## Usage
//!
//! ```rust,no_run
//! use karya_sync::{init_logging, Node, NodeConfig};
//!
//! async fn example() -> karya_sync::Result<()> {
//!     init_logging();
//!
//!     let config = NodeConfig::from_env()?;
//!     let node = Node::open(config).await?;
//!
//!     for (peer, outcome) in node.sync_all().await {
//!         println!("{}: {:?}", peer, outcome);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `karya_sync::core` - Records, timestamps, checksums and the batch codec
//! - `karya_sync::store` - Storage abstraction and SQLite
//! - `karya_sync::engine` - Collector, applier, file transfer and orchestration

pub mod config;
pub mod error;
pub mod logging;
pub mod node;

// Re-export component crates
pub use karya_sync_core as core;
pub use karya_sync_engine as engine;
pub use karya_sync_store as store;

pub use config::{ConfigError, NodeConfig, PeerConfig};
pub use error::{NodeError, Result};
pub use logging::init_logging;
pub use node::Node;

pub use karya_sync_engine::{CycleOutcome, CycleReport, Stage, StageOutcome, SyncConfig};
