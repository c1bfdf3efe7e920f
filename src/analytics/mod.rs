//! Cascading facet resolver and report aggregation engine.
//!
//! Resolves a loosely-specified sales-visit table, turns operator filter
//! picks into parameterized predicates, serves cascading option lists, and
//! derives the sales-funnel and route-tracking report blocks, with every
//! expensive query behind a ttl cache.
//!
//! # Module structure
//!
//! - [`types`]: filters, facets, cells, request context, error type
//! - [`dialect`]: SQL Server / SQLite fragments and validated table names
//! - [`store`]: the `FactStore` query seam and its rusqlite implementation
//! - [`schema`]: ordered-alias column resolution
//! - [`predicate`]: parameterized WHERE clauses
//! - [`cascade`]: distinct option lists, date bounds, form reconciliation
//! - [`cache`]: ttl + single-flight memoization with an injected clock
//! - [`fetch`]: preview/export row fetches, counts, outlier flags
//! - [`derive`]: safe division, numeric coercion, time parsing
//! - [`metrics`]: sales funnel and route summary
//! - [`engine`]: the `ReportEngine` facade tying it together

pub mod cache;
pub mod cascade;
pub mod derive;
pub mod dialect;
pub mod engine;
pub mod fetch;
pub mod metrics;
pub mod predicate;
pub mod schema;
pub mod store;
pub mod types;

// Re-export the most commonly used items at the crate::analytics level.
pub use cache::{CacheKey, CacheStats, Clock, ManualClock, SystemClock, TtlCache};
pub use cascade::{FacetControl, FilterForm};
pub use dialect::{Dialect, TableName};
pub use engine::{EngineOptions, Report, ReportEngine};
pub use fetch::OutlierFlags;
pub use metrics::{FunnelBucket, OutletClass, RouteSummary, SalesFunnel};
pub use predicate::Predicate;
pub use schema::{ColumnBinding, Dimension, FunnelColumn, FunnelSchema, SchemaMap};
pub use store::{FactStore, RawRows, SqliteStore};
pub use types::{
    ALL_SENTINEL, AnalyticsError, AnalyticsResult, CancelToken, Cell, DateRange, Facet,
    FacetValue, Fetched, FilterSelection, NamedParams, Operation, QueryFailure, ReadMode,
    ReportRow, RequestContext, RowSet, SqlValue,
};
