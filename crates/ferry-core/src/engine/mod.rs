pub mod backoff;
pub mod cancel;
pub mod pipeline;

pub use backoff::BackoffPolicy;
pub use cancel::CancelToken;
pub use pipeline::{BatchReport, EntityOutcome, MigrateOptions, MigrationEngine};
