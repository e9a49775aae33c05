//! Storage backends, metrics and retry policy for matching-service.

pub mod database;
pub mod memory;
pub mod metrics;
pub mod retry;
pub mod store;

pub use database::PgMatchStore;
pub use memory::InMemoryMatchStore;
pub use metrics::{
    get_metrics, init_metrics, record_auto_match_duration, record_error, record_match_operation,
    record_proposal,
};
pub use retry::RetryPolicy;
pub use store::{GroupRelease, MatchStore};
