//! Firkin is an embedded, persistent key-value store in the Bitcask
//! tradition: every mutation is appended to a numbered data file in a
//! single directory, and an in-memory index maps each key to the location
//! of its latest record.
//!
//! ```text
//!            put(k, v)                      get(k)
//!                │                             │
//!                ▼                             ▼
//!         ┌────────────┐   IndexEntry   ┌────────────┐
//!         │  Appender  │───────────────►│  KeyDir    │
//!         │  (file 0)  │                │ (in-memory)│
//!         └────────────┘                └────────────┘
//!                │                             │
//!                ▼ rotation                    ▼ pooled read
//!         ┌────────────┐     merge      ┌────────────┐
//!         │ inactive   │◄───────────────│ ReaderPool │
//!         │ files 1..n │                └────────────┘
//!         └────────────┘
//! ```
//!
//! Overwritten and deleted records become garbage that compaction
//! ([`Store::merge_if_needed`], [`Store::force_merge`]) reclaims by
//! rewriting the live records of inactive files into a single file, with a
//! hint sidecar that accelerates the next startup.

pub mod codec;
pub mod config;
pub mod datadir;
pub mod error;
pub mod flock;
pub mod index;
pub mod merge;
pub mod pool;
pub mod recovery;
pub mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use store::{Status, Store};
