//! # Snapshot Harness
//!
//! Project artifact ingestion: source code, documents and tables go in,
//! typed per-project snapshots come out.
//!
//! A project's staged files (uploaded, or shallow-cloned from an allow-listed
//! host) are routed to parser capabilities under size limits. Each parser
//! returns a flat namespaced field mapping, which a declarative mapping table
//! projects into the 14 canonical snapshot types. Validated records are
//! persisted with strict per-project isolation, one generation per project.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌────────┐   ┌──────────┐   ┌─────────┐   ┌─────────┐   ┌────────┐
//! │ Staging │──▶│ Router │──▶│ Adapters │──▶│ Mapping │──▶│ Builder │──▶│ Store  │
//! │ / Clone │   │ Limits │   │ ×4       │   │ table   │   │ schema  │   │ SQLite │
//! └─────────┘   └────────┘   └──────────┘   └─────────┘   └─────────┘   └────────┘
//!                    ▲                                                       │
//!                    └──────────────── Pipeline (manifest) ◀─────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! snap init                                  # create database
//! snap stage alpha src/app.py --file app.py  # upload a file
//! snap process alpha --vendor-id acme        # route, parse, map, persist
//! snap query alpha --type functions
//! snap notebook alpha
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Core data types |
//! | [`limits`] | Size and line-count verdicts |
//! | [`staging`] | Project-scoped staging area |
//! | [`acquire`] | Clone acquisition with retry |
//! | [`router`] | Staged tree → work plan |
//! | [`adapters`] | Parser capability contract and built-in backends |
//! | [`mapping`] | Declarative namespace → snapshot type table |
//! | [`builder`] | Identity, scope and schema validation |
//! | [`store`] | Snapshot repository (in-memory, SQLite) |
//! | [`pipeline`] | Run orchestration |
//! | [`manifest`] | Per-run processing manifest |
//! | [`progress`] | Run progress reporting |
//! | [`query`] | Query responses and project notebooks |
//! | [`stats`] | Store statistics report |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod acquire;
pub mod adapters;
pub mod builder;
pub mod config;
pub mod db;
pub mod error;
pub mod limits;
pub mod manifest;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod router;
pub mod staging;
pub mod stats;
pub mod store;

pub use error::{Result, SnapError};
pub use models::{ProjectId, SnapshotFilter, SnapshotRecord, SnapshotType};
pub use pipeline::{CancelToken, Pipeline, Source};
