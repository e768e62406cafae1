//! Concrete adapters for the [`contract`](crate::contract) ports.
//!
//! - [`SqliteStore`]: jobs, logs and version state in SQLite (`sqlx`).
//! - [`SqliteCredentialStore`]: encrypted per-user tokens in the same database.
//! - [`S3ObjectStore`]: S3-compatible bucket over plain HTTPS with SigV4.

mod migrations;
pub mod s3;
pub mod sqlite;

pub use s3::{S3Config, S3ObjectStore};
pub use sqlite::{SqliteCredentialStore, SqliteStore, VersionRecord};
