//! # Incident Snapshot
//!
//! Turns the newest published incident-database snapshot into a compact,
//! ranked JSON feed of recent incidents.
//!
//! The snapshot is a large bzip2-compressed tar archive that lists hundreds
//! of files. Exactly one of them holds the incident records, in JSON, JSON
//! lines or CSV. The pipeline streams the archive end to end and keeps only
//! that entry in memory, bounded by a configurable cap.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌────────┐   ┌───────────┐
//! │ Locator  │──▶│ Transport │──▶│  Demux  │──▶│ Parser │──▶│ Normalize │
//! │ (index)  │   │ HTTP+bz2  │   │  (tar)  │   │ J/JL/C │   │ + Rank    │
//! └──────────┘   └───────────┘   └─────────┘   └────────┘   └─────┬─────┘
//!                                                                 ▼
//!                                         ┌──────────┐     ┌────────────┐
//!                                         │  Cache   │◀───▶│  Pipeline  │──▶ JSON file
//!                                         └──────────┘     └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! incsnap run                          # write public/aiid-latest.json
//! incsnap run --stdout --progress json # print the result, JSON progress
//! incsnap locate                       # show the newest archive URL
//! incsnap inspect ./backup.tar.bz2     # process a local archive
//! incsnap watch --interval-secs 3600   # recurring job with a result cache
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline errors and reason codes |
//! | [`locator`] | Finding the newest archive on the index page |
//! | [`transport`] | HTTP streaming, decompression, cancellation |
//! | [`demux`] | Streaming tar walk and entry selection |
//! | [`parse`] | Format detection and record parsing |
//! | [`normalize`] | Field aliasing, ranking and truncation |
//! | [`pipeline`] | Stage driver producing a [`models::PipelineResult`] |
//! | [`persist`] | Atomic result file writer |
//! | [`cache`] | Injected result cache |
//! | [`progress`] | Progress reporting on stderr |

pub mod cache;
pub mod config;
pub mod demux;
pub mod error;
pub mod locator;
pub mod models;
pub mod normalize;
pub mod parse;
pub mod persist;
pub mod pipeline;
pub mod progress;
pub mod transport;
