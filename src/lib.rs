// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # kg-loom
//!
//! Knowledge-graph extraction core: turns rate-limited model completions into
//! a consolidated graph of namespaced triples.
//!
//! ## Architecture
//!
//! - **Gateway** (`gateway`): multi-key credential pool with per-key cooldowns
//!   and a retrying request executor with typed terminal errors
//! - **Salvage** (`salvage`): recovers JSON arrays/objects from fenced,
//!   truncated or slightly malformed completions
//! - **Extraction** (`extract`): converts salvaged records into triples
//! - **Graph** (`graph`): triple store, weakly-connected communities and the
//!   standardize → infer → merge → deduplicate → filter consolidation pass
//! - **Pipeline** (`pipeline`): parallel batches, model-backed inference and
//!   checkpoints
//!
//! ## Library usage
//!
//! ```no_run
//! use kg_loom::config::LoomConfig;
//! use kg_loom::extract::{self, Provenance};
//! use kg_loom::salvage;
//!
//! let config = LoomConfig::load(std::path::Path::new("kg-loom.toml")).unwrap();
//! let executor = config.executor().unwrap();
//! let request = config.model_settings().request("Extract triples from: ...");
//! let reply = executor.execute(&request).unwrap();
//! let records = salvage::parse_array(&reply);
//! let extraction = extract::triples_from_value(&records, &Provenance::default(), 3);
//! println!("{} triples", extraction.triples.len());
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod graph;
pub mod pipeline;
pub mod salvage;
