//! # Vault Capture
//!
//! Turns messages sent to a capture bot (text, voice notes, photos,
//! documents, links) into notes and archived files in a markdown
//! knowledge vault.
//!
//! Every message is registered in a SQLite state store, then driven through
//! extraction, a security gate, intent classification and one of four
//! pipelines before the result is written to the vault.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │   Source    │──▶│  State   │──▶│ Extract  │──▶│ Security │
//! │ bot/direct  │   │  SQLite  │   │ adapters │   │   gate   │
//! └─────────────┘   └──────────┘   └──────────┘   └────┬─────┘
//!                                                      │
//!             ┌──────────┐   ┌───────────┐   ┌─────────▼─┐
//!             │  Vault   │◀──│ Pipelines │◀──│ Classify  │
//!             │ + notify │   │ note/clip │   │  router   │
//!             └──────────┘   └───────────┘   └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vcap init                          # create database
//! vcap poll                          # fetch new messages
//! vcap process                       # run pending messages
//! vcap watch --interval 60           # poll + process on a timer
//! vcap direct ./scan.pdf --caption "[type:RECEIPT] #home"
//! vcap status
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`state`] | Processing state machine |
//! | [`source`] | Message sources and direct injection |
//! | [`extract`] | Content extraction adapters |
//! | [`hints`] | Inline hint syntax |
//! | [`security`] | Security gate |
//! | [`classify`] | Pipeline routing and intent oracles |
//! | [`pipelines`] | Note, clip, archive and receipt pipelines |
//! | [`vault`] | Vault writes |
//! | [`notify`] | Outcome events |
//! | [`process`] | Orchestration |

pub mod audit;
pub mod classify;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod hints;
pub mod llm;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod notify;
pub mod pipelines;
pub mod process;
pub mod progress;
pub mod security;
pub mod source;
pub mod state;
pub mod status;
pub mod tags;
pub mod vault;
