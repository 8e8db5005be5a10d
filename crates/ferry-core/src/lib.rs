//! Ferry core library: resumable, ledger-backed migration of issues,
//! comments, and attachments between two issue trackers.
//!
//! The pieces are wired explicitly by the caller: a [`config::FerryConfig`],
//! a [`store::Ledger`], a [`mapping::MappingResolver`], and the source/target
//! [`repository`] implementations go into an [`engine::MigrationEngine`];
//! [`retry::RetryCoordinator`] and [`validate::Validator`] work from the same
//! ledger afterwards. Logging goes through `tracing`; no subscriber is
//! installed here.

pub mod config;
pub mod engine;
pub mod errors;
pub mod guards;
pub mod mapping;
pub mod models;
pub mod repository;
pub mod retry;
pub mod store;
pub mod validate;

pub use config::FerryConfig;
pub use engine::{MigrateOptions, MigrationEngine};
pub use errors::{FerryError, FerryResult};
pub use mapping::{MappingResolver, MappingTable};
pub use retry::RetryCoordinator;
pub use store::Ledger;
pub use validate::{ValidationScope, Validator};
