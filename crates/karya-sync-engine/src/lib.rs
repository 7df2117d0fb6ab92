//! # Karya Sync Engine
//!
//! Watermark-based synchronization between the tiers of a Karya deployment:
//! worker clients, offline edge boxes and the central server.
//!
//! ## Overview
//!
//! Each node keeps, per peer and per table, two watermarks: the newest
//! `last_updated_at` it has sent and the newest it has received. A sync
//! cycle pushes rows newer than the sent watermark, pulls rows newer than
//! the received watermark and moves attachment bytes whose presence flags
//! say they are missing on one side. Every step is idempotent, so a cycle
//! cut short by a lost connection is simply run again.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-applying a row that is already stored changes nothing
//! - **Last writer wins**: a row only replaces one with an older timestamp
//! - **Monotonic**: watermarks never move backward
//! - **Verified**: attachment bytes are only marked present after a checksum match
//!
//! ## Key Types
//!
//! - [`SyncOrchestrator`] - Runs cycles against an upstream peer
//! - [`SyncScheduler`] - Runs cycles periodically
//! - [`Endpoint`] - Serves the calls a downstream node makes
//! - [`router`] - The HTTP routes in front of an [`Endpoint`]
//! - [`Transport`] - How calls reach a peer ([`HttpTransport`], [`MemoryTransport`])
//! - [`TableRegistry`] - The syncable tables, their authority and merge rules
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use karya_sync_core::{PeerId, Tier};
//! use karya_sync_engine::{
//!     CycleOutcome, FileStorage, HttpTransport, SyncConfig, SyncOrchestrator, TableRegistry,
//! };
//! use karya_sync_store::SqliteStore;
//!
//! async fn example() -> karya_sync_engine::Result<()> {
//!     let config = SyncConfig::default();
//!     let store = Arc::new(SqliteStore::open("box.db")?);
//!     let transport = Arc::new(HttpTransport::new(PeerId::new("box-1"), &config)?);
//!
//!     let orchestrator = SyncOrchestrator::new(
//!         Tier::Edge,
//!         store,
//!         transport,
//!         FileStorage::new("/var/lib/karya/files"),
//!         Arc::new(TableRegistry::standard()),
//!         config,
//!     );
//!
//!     if let CycleOutcome::Completed(report) = orchestrator.run_cycle(&PeerId::new("central")).await {
//!         println!("sent {} rows, received {}", report.rows_sent, report.rows_received);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Cycle Flow
//!
//! ```text
//! Box                                 Central
//!   |-------- GET /renew-token ------->|
//!   |-------- PUT /upload-file ------->|   (files held only here)
//!   |-------- POST /updates ---------->|   (rows > sent watermark)
//!   |-------- GET /updates?from= ----->|   (rows > received watermark)
//!   |-------- GET /file/{id} --------->|   (files held only there)
//!   |-------- GET <url> -------------->|   (/files/{container}/{name})
//! ```

pub mod applier;
pub mod collector;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod files;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod transport;

pub use applier::{ApplyReport, RecordApplier, RowOutcome, RowReport};
pub use collector::{ChangeCollector, CollectedPage};
pub use config::SyncConfig;
pub use endpoint::{Endpoint, UploadOutcome};
pub use error::{Result, SyncError};
pub use files::{
    FileOutcome, FileStorage, FileTransferManager, TransferDirection, TransferReport,
    TransferState,
};
pub use orchestrator::{
    CycleOutcome, CycleReport, Stage, StageOutcome, StageReport, SyncOrchestrator, ViewRefresher,
};
pub use registry::{
    AssignmentHandler, Authority, FileRecordHandler, MergeContext, PlainUpsert, TableHandler,
    TableRegistry, TableSpec,
};
pub use scheduler::SyncScheduler;
pub use server::{router, serve, ServerError, FILES_PATH};
pub use transport::{
    memory::MemoryNetwork, memory::MemoryTransport, HttpTransport, RenewedToken, Transport,
};
