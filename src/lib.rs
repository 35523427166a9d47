//! # docdupe
//!
//! Near-duplicate detection for large OCR'd document corpora.
//!
//! The detection engine (normalization, MinHash, LSH, scoring, grouping,
//! confidence recalculation) lives in [`docdupe_core`]. This crate adds the
//! SQLite store, the incremental analysis controller, file import, and the
//! `ddup` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────┐
//! │  import  │──▶│       SQLite         │◀──│  analysis │
//! │ (walkdir)│   │ documents / groups   │   │ controller│
//! └──────────┘   └──────────────────────┘   └─────┬─────┘
//!                                                 │
//!                                                 ▼
//!                                          ┌─────────────┐
//!                                          │docdupe-core │
//!                                          │ MinHash+LSH │
//!                                          └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the core `Store` trait |
//! | [`analysis`] | Incremental analysis controller and run bookkeeping |
//! | [`progress`] | Progress reporting and the per-run handle |
//! | [`import`] | Local text-file ingestion |
//! | [`groups`] | Group listing and confidence recalculation |
//! | [`stats`] | Database statistics and run history |

pub mod analysis;
pub mod config;
pub mod db;
pub mod groups;
pub mod import;
pub mod migrate;
pub mod progress;
pub mod sqlite_store;
pub mod stats;
