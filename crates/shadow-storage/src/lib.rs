//! Durable state for shadow enrichment: persisted quota windows and the
//! field-merging profile store.

pub mod backoff;
pub mod files;
pub mod locks;
pub mod quota;
pub mod sqlite;
pub mod store;

pub const CRATE_NAME: &str = "shadow-storage";

pub use backoff::{BackoffPolicy, RetryLedger};
pub use files::write_atomic;
pub use locks::KeyedLocks;
pub use quota::{QuotaError, QuotaState, QuotaTracker, QuotaWindow, Reservation};
pub use sqlite::{classify_sqlx_error, SqliteBackend};
pub use store::{
    AttemptRecord, BackendError, EdgeKey, ShadowBackend, ShadowStore, StoreError,
};
