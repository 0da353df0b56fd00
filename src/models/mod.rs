//! Core data models for the upload pipeline.
//!
//! Types that are persisted map to SQLite tables via `sqlx::FromRow`; types
//! that cross the HTTP boundary serialize as camelCase JSON via `serde`.

pub mod file_record;
pub mod multipart;
pub mod upload;
