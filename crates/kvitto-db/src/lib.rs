//! # kvitto-db
//!
//! PostgreSQL persistence layer for kvitto: connection pool management,
//! the advisory-lock primitive, and repository implementations for
//! documents, brands, processing events, and job runs.

pub mod advisory;
pub mod brands;
pub mod documents;
pub mod events;
pub mod job_runs;
pub mod pool;
pub mod schema;
pub mod test_fixtures;

pub use advisory::{advisory_key, try_lock, unlock_and_close};
pub use brands::PgBrandRepository;
pub use documents::PgDocumentRepository;
pub use events::PgEventRepository;
pub use job_runs::PgJobRunRepository;
pub use pool::{create_pool, create_pool_with_config, PoolConfig};
