//! # unit-hunter
//!
//! A cache-backed scanner that finds Java types below directories and inside
//! (nested) archives, selected by composable criteria.
//!
//! ## Architecture
//!
//! - **path**: normalized scan roots and entry keys (`outer.jar!/inner.jar!/A.java`)
//! - **tasks**: bounded task pool with nested submission and completion barrier
//! - **walker**: parallel directory and archive traversal driven by predicates
//! - **unit**: unit descriptors, found items and the parser seam
//! - **source**: tree-sitter based Java source parser
//! - **hierarchy**: links parsed supertypes into ancestor chains
//! - **criteria** / **member**: boolean expressions over units and their members
//! - **context**: per-query result accumulator
//! - **cache**: path-keyed cache of complete root harvests and containment checks
//! - **scanner**: query façade reconciling requested roots with the cache
//! - **snapshot**: LMDB persistence of the cache
//! - **config** / **cli** / **logging**: binary plumbing

pub mod cache;
pub mod cli;
pub mod config;
pub mod context;
pub mod criteria;
pub mod error;
pub mod hierarchy;
pub mod logging;
pub mod member;
pub mod path;
pub mod scanner;
pub mod snapshot;
pub mod source;
pub mod tasks;
pub mod unit;
pub mod walker;

pub use context::SearchContext;
pub use criteria::UnitCriteria;
pub use error::{Result, ScanError};
pub use member::MemberCriteria;
pub use scanner::{ScannerState, SearchConfig, UnitScanner};
pub use unit::{FoundItem, UnitDescriptor, UnitParser};
