//! Session lifecycle: records, persistence, and the connection core

pub mod manager;
pub(crate) mod registry;
pub mod retry;
pub mod state;
pub mod store;

pub use manager::{ManagerOptions, SessionManager};
pub use registry::RegistryStats;
pub use retry::{ArmOutcome, RetryPolicy};
pub use state::{
    validate_session_id, FieldUpdate, Session, SessionPatch, SessionStatus, StatusChange,
};
pub use store::{SessionStore, SqliteSessionStore};
