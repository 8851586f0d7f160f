//! A tag- and range-indexable key/value document store over SQLite.
//!
//! Values are opaque byte payloads keyed by string within a logical index.
//! Alongside each value the caller may store an index entry: a JSON
//! attribute map, an opaque byte sorter ordered byte-wise, an optional
//! secondary key, and a set of tags fanned out one row per tag. Queries
//! combine those predicates and return keys, lazily and paginated.
//!
//! Every statement is rendered from a named SQL template, so schema and
//! dialect variations are a matter of configuration (`queries.<name>`
//! overrides), not code. Tables for an index are created lazily on first
//! touch, and advisory per-key lease locks use the backend's clock for
//! expiry so all participants agree on it.
//!
//! ```no_run
//! use relkv::{Store, StoreConfig, QuerySpec};
//!
//! # fn main() -> relkv::Result<()> {
//! let store = Store::open(StoreConfig::new("data.db"))?;
//! store.put_value("people", "alice", b"payload")?;
//! store.put_index_entry(
//!     "people",
//!     "alice",
//!     &relkv::Attributes::new(),
//!     Some(&b"1984"[..]),
//!     None,
//!     &["admin".to_string()],
//! )?;
//!
//! let spec = QuerySpec {
//!     tags: Some(vec!["admin".to_string()]),
//!     ..QuerySpec::default()
//! };
//! for key in store.query_all("people", &spec)? {
//!     println!("{}", key?);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod lock;
mod pool;
mod query;
mod schema;
mod store;
mod template;

pub use config::{PoolConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use lock::LockTicket;
pub use query::{Keys, QuerySpec, TextSearch};
pub use store::{Attributes, Store};
pub use template::QueryId;
