// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # causa
//!
//! Abductive explanation of vanished facts in a symbolic world model.
//!
//! A scenario is a sequence of steps applied to a typed knowledge store. When
//! a step retracts a location fact, the causal matcher looks for a recently
//! registered event that plausibly caused it and links the two. When nothing
//! qualifies, the gap is handed to an LLM hypothesis generator whose output is
//! parsed, validated and graded against the store's vocabulary.
//!
//! ## Architecture
//!
//! - **Knowledge store** (`kb`): TOML ontologies merged into a `TBox`, an
//!   in-memory ABox and a bounded materialiser
//! - **Scenarios** (`scenario`): steps of typings, asserts, retracts,
//!   updates and deletes
//! - **Causal matcher** (`causal`, `registry`): windowed, gated, scored search
//!   for a cause
//! - **Orchestrator** (`runtime`): applies steps, re-reasons, halts on a gap
//! - **Hypotheses** (`hypotheses`, `llm`, `retrieval`, `vocab`): four
//!   generator tiers over an OpenAI-compatible chat endpoint
//! - **Batch driver** (`batch`): repeated trials written as JSONL
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use causa::kb::MemoryStore;
//! use causa::runtime::{run_scenario, ExperimentConfig};
//! use causa::scenario::Scenario;
//!
//! let scenario = Scenario::bundled("nominal").unwrap();
//! let tbox = Arc::new(scenario.build_tbox().unwrap());
//! let mut store = MemoryStore::new(tbox);
//! let report = run_scenario(&mut store, &scenario, &ExperimentConfig::default());
//! for exp in &report.explanations {
//!     println!("{}", exp.text);
//! }
//! ```

pub mod batch;
pub mod causal;
pub mod config;
pub mod error;
pub mod hypotheses;
pub mod kb;
pub mod llm;
pub mod registry;
pub mod retrieval;
pub mod runtime;
pub mod scenario;
pub mod symbol;
pub mod vocab;
