//! aex Memory - key/value persistence for engine statistics and traces
//!
//! ## Backends
//!
//! - **InMemoryStore**: DashMap-backed, cleared on restart (default)
//! - **FileStore**: JSON file that survives restarts
//!
//! Both accept an optional `max_entries` limit; the oldest writes are evicted
//! first.
//!
//! ```rust,no_run
//! use aex_memory::{FileStore, InMemoryStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ephemeral = InMemoryStore::new();
//! let persistent = FileStore::with_max_entries("./engine-state.json", Some(500)).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;

pub use backend::file::FileStore;
pub use backend::memory::InMemoryStore;
pub use backend::StoredEntry;

pub use aex_core::KvStore;
