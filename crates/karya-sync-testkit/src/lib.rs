//! # Karya Sync Testkit
//!
//! Testing utilities for Karya sync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Nodes of every tier wired onto one in-memory network, plus
//!   row builders for the Karya tables
//! - **Transport wrappers**: Record pushed payloads or hold a cycle open
//! - **Generators**: Proptest strategies for rows, batches and statuses
//!
//! End-to-end scenarios across the three tiers live in this crate's `tests/`.
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use karya_sync_core::{TableName, Tier, Timestamp};
//! use karya_sync_testkit::fixtures::{completed, put_rows, task, TestFixture};
//!
//! # async fn example() {
//! let fixture = TestFixture::new();
//! let central = fixture.node("central", Tier::Central, None).await;
//! let edge = fixture.node("box-1", Tier::Edge, Some(&central)).await;
//!
//! put_rows(&central, &TableName::TASK, &[task("t-1", Timestamp::from_millis(1_000))]).await;
//! let report = completed(edge.sync_with(central.id()).await);
//! assert_eq!(report.rows_received, 1);
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use karya_sync_testkit::generators::change_batch;
//!
//! proptest! {
//!     #[test]
//!     fn batches_roundtrip(batch in change_batch(8)) {
//!         let encoded = karya_sync_core::encode(&[batch.clone()]).unwrap();
//!         prop_assert_eq!(karya_sync_core::decode(&encoded).unwrap(), vec![batch]);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{
    completed, put_rows, record_local_file, GatedTransport, RecordingTransport, TestFixture,
    OUTPUT_CONTAINER,
};
