//! Conversation store adapter.
//!
//! SQLite-backed persistence for users, sessions, messages, documents, and
//! the per-user memory blob. Safe for concurrent use within one process; the
//! connection sits behind a mutex.

pub mod db;
pub mod error;
pub mod manager;
pub mod memory;
pub mod types;

pub use error::{Result, StoreError};
pub use manager::Store;
pub use types::{DocumentRecord, MessageRecord, SessionInfo, SessionRecord, UserRecord};
