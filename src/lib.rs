//! # Chunk Courier
//!
//! A local-first ingestion pipeline that splits workspace files into bounded
//! chunks and delivers them reliably to a remote indexing service.
//!
//! Chunk Courier scans a workspace, splits each file into chunks (line-based
//! or semantic-boundary), compresses payloads when it pays off, skips chunks
//! and files already delivered, and sends the rest over HTTP through a
//! bounded connection pool with retry, backoff, and cooperative cancellation.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌───────────┐   ┌───────────────┐   ┌──────────┐
//! │ Workspace │──▶│ Splitter  │──▶│ Dedup + Index │──▶│ Delivery │
//! │   scan    │   │ line/sem  │   │  (skip known) │   │ pool+retry│
//! └───────────┘   └───────────┘   └───────────────┘   └────┬─────┘
//!                                                          │
//!                                                          ▼
//!                                                   ┌─────────────┐
//!                                                   │  Indexing   │
//!                                                   │   service   │
//!                                                   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! courier check                 # verify config and endpoint health
//! courier sync                  # deliver modified files
//! courier sync --full           # ignore the change index, resend everything
//! courier stats                 # summarize local cache state
//! courier clean                 # drop expired cache entries
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`scan`] | Workspace file discovery |
//! | [`splitter`] | Line-based chunk splitting |
//! | [`semantic`] | Semantic-boundary chunk splitting |
//! | [`compress`] | Conditional payload compression |
//! | [`persist`] | Debounced write-behind JSON stores |
//! | [`dedup`] | Delivered-chunk deduplication cache |
//! | [`fileindex`] | File change-detection index |
//! | [`pool`] | Bounded connection pool |
//! | [`batcher`] | Request coalescing |
//! | [`remote`] | HTTP transport to the indexing service |
//! | [`deliver`] | Delivery orchestration |
//! | [`progress`] | Progress reporting |
//! | [`stats`] | Local state statistics |

pub mod batcher;
pub mod compress;
pub mod config;
pub mod dedup;
pub mod deliver;
pub mod fileindex;
pub mod models;
pub mod persist;
pub mod pool;
pub mod progress;
pub mod remote;
pub mod scan;
pub mod semantic;
pub mod splitter;
pub mod stats;
