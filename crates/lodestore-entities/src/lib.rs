//! Lodestore Entities: typed record collections over `lodestore-core`
//!
//! An [`Entities`] collection keeps every record in memory and persists
//! changes in the background.
//!
//! # Architecture
//!
//! - **Cell**: thread-safe string-keyed map with lazy, non-snapshot iteration
//! - **Tracked map**: the cell plus pending-persist and pending-delete sets
//!   and mutation observers
//! - **Persistence**: a flusher thread committing dirty keys as one engine
//!   batch per cycle, and the startup loader
//! - **Index**: observer-maintained exact-match secondary indexes
//! - **Load barrier**: lets callers wait for deferred startup loads
//!
//! ```no_run
//! use lodestore_entities::{Entities, Record, StoreConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Serialize, Deserialize)]
//! struct User {
//!     id: String,
//!     email: String,
//! }
//!
//! impl Record for User {
//!     fn key(&self) -> &str {
//!         &self.id
//!     }
//! }
//!
//! let users: Entities<User> = Entities::open("./users", StoreConfig::default())?;
//! let by_email = users.create_index("email", |u: &User| u.email.clone());
//! users.add(User { id: "1".into(), email: "a@example.com".into() });
//! assert_eq!(by_email.each("a@example.com").count(), 1);
//! users.close()?;
//! # Ok::<(), lodestore_entities::StoreError>(())
//! ```

pub mod barrier;
pub mod cell;
pub mod config;
pub mod entities;
pub mod error;
pub mod index;
pub mod persistence;
pub mod tracked;

pub use barrier::{LoadBarrier, LoadTicket};
pub use cell::Cell;
pub use config::{ConfigError, StoreConfig};
pub use entities::{Entities, Metrics, Record};
pub use error::{exit_on_fatal, FatalHandler, StoreError, StoreResult};
pub use index::Index;
pub use persistence::{FlushCounters, FlushHandle, Persistence};
pub use tracked::{MapMetrics, Observer, PendingKey, TrackedMap};
