//! Offline-first chain cache and durable write queue.
//!
//! [`OfflineStore`] keeps a bounded local copy of remote chain records and an
//! ordered backlog of mutations that could not be applied yet. The
//! [`RetryScheduler`] drains that backlog against an [`Executor`] whenever the
//! process believes it is online, and [`StatusSnapshot`] folds connectivity
//! and backlog depth into one observable status.

pub mod cache;
pub mod config;
pub mod connectivity;
pub mod executor;
pub mod queue;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod sync;

pub use cache::{CacheEntry, EntrySyncStatus, MAX_CACHE_ENTRIES};
pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use executor::{Executor, HttpExecutor};
pub use queue::{QueuedWrite, MAX_RETRIES};
pub use scheduler::RetryScheduler;
pub use status::{StatusSnapshot, SyncStatus};
pub use store::{DurableStore, MemoryStore, Namespace, SqliteStore};
pub use sync::{DrainReport, OfflineStore, SkipReason, StoreSettings};
