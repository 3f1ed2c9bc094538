pub mod changelog_fetcher;
pub mod client;
pub mod duckdb_store;
pub mod error;
pub mod export;
pub mod import;
pub mod models;
pub mod normalizer;
pub mod paginator;

pub use client::{Credentials, JiraClient, JiraConfig, RawResponse, RequestPolicy};
pub use error::{Error, Result};
pub use models::*;

// Fetch re-exports
pub use changelog_fetcher::IssueChangelog;

// Normalizer re-exports
pub use normalizer::{ChangeRow, IssueRow, RowNormalizer};

// DuckDB store re-exports
pub use duckdb_store::{DuckDBStore, QueryResult, StatusDuration, WriteMode};

// Export re-exports
pub use export::{ExportFormat, export_query};

// Import re-exports
pub use import::{ImportOptions, ImportService, ImportSummary};
