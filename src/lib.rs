//! # mailtrace
//!
//! Turns batches of e-mail messages into confidence-scored action items,
//! each traceable back to the message(s) that justify it.
//!
//! mailtrace suppresses duplicate messages, scores each message with
//! sandboxed Lua heuristics, asks a pluggable generative backend for
//! candidate items, validates (and if needed degrades) that answer, and
//! merges both signals into one confidence per item. No candidate item is
//! silently dropped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌───────────┐   ┌────────────┐
//! │  Parser  │──▶│  Dedup  │──▶│ Lua rules │──▶│ Generator  │
//! │  (JSON)  │   │ history │   │  sandbox  │   │ local/remote│
//! └──────────┘   └────┬────┘   └─────┬─────┘   └─────┬──────┘
//!                     │              │               ▼
//!                     │              │        ┌────────────┐
//!                     │              └───────▶│ Validator  │
//!                     │                       │ Confidence │
//!                     ▼                       └─────┬──────┘
//!                ┌─────────┐                        │
//!                │ SQLite  │◀───────────────────────┘
//!                └─────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mailtrace init                         # create database
//! mailtrace process ./inbox/             # extract action items
//! mailtrace rules ./inbox/one.json       # show rule evidence for a message
//! mailtrace stats                        # persisted totals
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`fingerprint`] | Message fingerprints and Message-ID validation |
//! | [`dedup`] | Same-batch and cross-batch duplicate detection |
//! | [`store`] | Persistence abstraction (SQLite and in-memory) |
//! | [`lua_runtime`] | Sandboxed Lua VM construction |
//! | [`rules`] | Heuristic rule catalog and evaluator |
//! | [`generator`] | Generative backend abstraction |
//! | [`validator`] | Schema validation with degradation |
//! | [`confidence`] | Dual-engine confidence scoring |
//! | [`pipeline`] | Batch orchestration |
//! | [`mode`] | Deferred local/remote mode switching |
//! | [`parser`] | Message parser seam |
//! | [`audit`] | JSON-lines audit trail |
//! | [`report`] | Traceability lines |
//! | [`stats`] | Database totals |
//! | [`error`] | Fatal batch errors |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod audit;
pub mod confidence;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod fingerprint;
pub mod generator;
pub mod lua_runtime;
pub mod migrate;
pub mod mode;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod report;
pub mod rules;
pub mod stats;
pub mod store;
pub mod validator;
