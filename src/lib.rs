//! # Newsroom
//!
//! Feed polling, content canonicalization, duplicate clustering and
//! personalized ranking for a news aggregator.
//!
//! Registered sources are polled on their own schedule, either natively
//! (RSS/Atom fetch, entry parsing, optional full-page extraction) or by a
//! legacy script. Every accepted entry is normalized to a canonical HTML
//! subset and stored with full-text indexes; every poll attempt leaves an
//! audit row. Offline jobs embed stored articles, group near-duplicates and
//! materialize a ranked article list per subscriber.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐   ┌──────────┐
//! │ sources  │──▶│ gate + fetch │──▶│ retrieve  │──▶│  SQLite  │
//! │ registry │   │ feed/script  │   │ normalize │   │ FTS5+Vec │
//! └──────────┘   └──────┬───────┘   └───────────┘   └────┬─────┘
//!                       ▼                                │
//!                  poll_runs                 ┌───────────┼──────────┐
//!                                            ▼           ▼          ▼
//!                                         embed       cluster      rank
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! newsroom init                  # create database
//! newsroom sources --sync        # load [[sources]] from config
//! newsroom poll                  # poll every due source
//! newsroom embed pending         # embed new articles
//! newsroom cluster               # print near-duplicate sets as JSON
//! newsroom rank --variant score  # rebuild every subscriber's list
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`status`] | Poll status codes |
//! | [`frequency`] | Per-source polling schedule |
//! | [`script`] | Legacy poller scripts |
//! | [`feed`] | Feed fetching and entry parsing |
//! | [`cookies`] | Cookie files for authenticated sources |
//! | [`retrieve`] | Concurrent entry retrieval |
//! | [`normalize`] | Canonical HTML subset |
//! | [`store`] | Article storage |
//! | [`audit`] | Poll audit log |
//! | [`poll`] | Poll orchestration |
//! | [`sources`] | Source registry |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`embed_cmd`] | Batch article embedding |
//! | [`cluster`] | Near-duplicate clustering |
//! | [`rank`] | Personalized ranking |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod audit;
pub mod cluster;
pub mod config;
pub mod cookies;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod feed;
pub mod frequency;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod poll;
pub mod rank;
pub mod retrieve;
pub mod script;
pub mod sources;
pub mod status;
pub mod store;
