//! Identifiers and the tabular result model.
//!
//! This crate has no infrastructure concerns (no IO, no threads).

pub mod error;
pub mod id;
pub mod table;

pub use error::{CoreError, CoreResult};
pub use id::{CacheKey, EntityId, JobId, KeySpace, QueryKind};
pub use table::{Column, ColumnData, ColumnType, Table, TableBuilder, Value};
