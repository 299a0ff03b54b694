//! stagehand-state — persistence for the Stagehand scheduler.
//!
//! # Architecture
//!
//! ```text
//! FrameworkStore ─┐
//! StateStore ─────┼──▶ Arc<dyn Persister>
//! ConfigStore<T> ─┘        ├── MemPersister    (tests, dry runs)
//!                          ├── RedbPersister   (durable, one table)
//!                          └── PersisterCache  (write-through copy of another)
//! ```
//!
//! Values are JSON-encoded bytes at `/`-separated paths. Each service owns
//! its own database file, which is the service-rooted prefix of the layout.

pub mod cache;
pub mod config;
pub mod durable;
pub mod error;
pub mod framework;
pub mod persister;
pub mod tables;
pub mod tasks;

pub use cache::PersisterCache;
pub use config::{ConfigCodec, ConfigStore, JsonCodec};
pub use durable::RedbPersister;
pub use error::{StateError, StateResult};
pub use framework::FrameworkStore;
pub use persister::{MemPersister, Persister};
pub use tasks::StateStore;
