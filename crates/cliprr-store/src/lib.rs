//! Durable state for the cliprr pipeline: jobs, fingerprints, detection
//! results, settings, and the catalog transaction boundaries.
//!
//! Backed by SQLite through sqlx; migrations are embedded and idempotent and
//! run once at startup.

pub mod catalog;
pub mod database;
pub mod error;
pub mod fingerprints;
pub mod jobs;
pub mod settings;

pub use catalog::{CatalogStore, EpisodeImport, SeasonImport, ShowImport};
pub use database::Database;
pub use error::{StoreError, StoreResult};
pub use fingerprints::FingerprintStore;
pub use jobs::{JobPatch, JobStore};
pub use settings::{ImportMode, SettingsStore};
