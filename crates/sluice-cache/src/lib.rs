//! Sluice Cache
//!
//! Content-addressed result reuse for sluice.
//!
//! # Architecture
//!
//! ```text
//! hash_file(path) -> ContentHash (SHA-256 hex)
//!
//! DatasetRegistry
//! ├── register_file(path) -> Dataset { hash, size, path }
//! └── purge(id)           - drop bytes, keep metadata
//!
//! ResultCache
//! ├── insert(method, input_hashes, derived_from) -> ExecRecord (running)
//! ├── complete / fail
//! ├── decide(method, input_hashes, datasets) -> Reuse | Recover | Miss
//! └── redact(id)          - cascades to derived records
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use sluice_cache::{DatasetRegistry, ResultCache, ReuseDecision};
//!
//! match cache.decide(&method, &input_hashes, &datasets) {
//!     ReuseDecision::Reuse(record) => tree.attach_reuse(node, record.id)?,
//!     ReuseDecision::Recover(record) => { /* regenerate purged outputs */ }
//!     ReuseDecision::Miss => { /* dispatch */ }
//! }
//! ```

mod cache;
mod dataset;
mod error;
mod hash;
mod log;

pub use cache::{ExecRecord, RecordId, RecordStatus, ResultCache, ReuseDecision};
pub use dataset::{Dataset, DatasetId, DatasetRegistry};
pub use error::CacheError;
pub use hash::{ContentHash, hash_bytes, hash_file};
pub use log::ExecLog;
