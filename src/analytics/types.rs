//! Shared types for the report engine.
//!
//! Filters, facets, row cells, request context and the error type live here so
//! that the schema resolver, predicate builder, cascade, fetchers and metrics
//! all speak the same vocabulary.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Report-engine error.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyticsError {
    /// The column catalog could not be read. Callers degrade to the fallback
    /// column list.
    #[error("schema catalog unavailable for '{table}': {message}")]
    SchemaUnavailable { table: String, message: String },

    /// A facet / row / aggregate query raised a database error.
    #[error("{operation} query failed: {message}")]
    QueryFailed { operation: Operation, message: String },

    /// None of the preferred report columns exist in the fact table.
    #[error("no report columns found in '{0}'; verify the table schema")]
    NoReportColumns(String),

    /// The request was abandoned before the producer finished.
    #[error("request cancelled")]
    Cancelled,

    /// Preview row caps must be at least one row.
    #[error("invalid row cap {0}: must be at least 1")]
    InvalidRowCap(usize),
}

impl AnalyticsError {
    pub fn query(operation: Operation, err: impl std::fmt::Display) -> Self {
        Self::QueryFailed {
            operation,
            message: err.to_string(),
        }
    }

    /// Attribute a query failure to `operation`. Other variants pass through.
    pub fn relabel(self, operation: Operation) -> Self {
        match self {
            Self::QueryFailed { message, .. } => Self::QueryFailed { operation, message },
            other => other,
        }
    }
}

/// Convenience alias.
pub type AnalyticsResult<T> = std::result::Result<T, AnalyticsError>;

// ---------------------------------------------------------------------------
// Operations and reported failures
// ---------------------------------------------------------------------------

/// Which engine operation produced a value (or failed to).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "operation", content = "facet", rename_all = "snake_case")]
pub enum Operation {
    Schema,
    FunnelSchema,
    FacetOptions(Facet),
    DateRange,
    PreviewRows,
    ExportRows,
    RowCount,
    RouteAggregate,
    FunnelTotals,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema => write!(f, "schema"),
            Self::FunnelSchema => write!(f, "funnel schema"),
            Self::FacetOptions(facet) => write!(f, "{facet} options"),
            Self::DateRange => write!(f, "date range"),
            Self::PreviewRows => write!(f, "preview rows"),
            Self::ExportRows => write!(f, "export rows"),
            Self::RowCount => write!(f, "row count"),
            Self::RouteAggregate => write!(f, "route aggregate"),
            Self::FunnelTotals => write!(f, "funnel totals"),
        }
    }
}

/// A failure caught at a component boundary and handed to the caller next to
/// the empty/default value that replaced the result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryFailure {
    pub operation: Operation,
    pub message: String,
}

impl QueryFailure {
    pub fn new(operation: Operation, err: &AnalyticsError) -> Self {
        Self {
            operation,
            message: err.to_string(),
        }
    }
}

/// The outcome of one engine operation: always a usable value, plus the
/// failure that forced it to a default when something went wrong.
#[derive(Debug, Clone)]
pub struct Fetched<T> {
    pub value: T,
    pub failure: Option<QueryFailure>,
}

impl<T> Fetched<T> {
    pub fn ok(value: T) -> Self {
        Self {
            value,
            failure: None,
        }
    }

    pub fn degraded(value: T, failure: QueryFailure) -> Self {
        Self {
            value,
            failure: Some(failure),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }

    pub fn map_value<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        Fetched {
            value: f(self.value),
            failure: self.failure,
        }
    }

    /// Split into the value, pushing any failure onto `sink`.
    pub fn collect_into(self, sink: &mut Vec<QueryFailure>) -> T {
        if let Some(failure) = self.failure {
            sink.push(failure);
        }
        self.value
    }
}

// ---------------------------------------------------------------------------
// Request context
// ---------------------------------------------------------------------------

/// Read-consistency mode for every query in a request.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadMode {
    #[default]
    Committed,
    /// Dirty reads: the dialect adds its no-lock hint.
    Uncommitted,
}

impl ReadMode {
    pub fn from_dirty_flag(dirty: bool) -> Self {
        if dirty {
            Self::Uncommitted
        } else {
            Self::Committed
        }
    }

    pub fn is_dirty(self) -> bool {
        matches!(self, Self::Uncommitted)
    }
}

/// Shared cancellation flag for one request.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether `other` is a handle to this same request's flag.
    pub fn same_request(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// `Err(Cancelled)` once the request has been abandoned.
    pub fn check(&self) -> AnalyticsResult<()> {
        if self.is_cancelled() {
            Err(AnalyticsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Per-request context threaded through every cache key and query.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub read_mode: ReadMode,
    pub cancel: CancelToken,
}

impl RequestContext {
    pub fn new(read_mode: ReadMode) -> Self {
        Self {
            read_mode,
            cancel: CancelToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Facets and filter selection
// ---------------------------------------------------------------------------

/// The synthetic sentinel shown at the top of every option list.
pub const ALL_SENTINEL: &str = "All";

/// Marks operator input as a literal value rather than the sentinel.
pub const LITERAL_PREFIX: char = '=';

/// One filterable dimension in the cascade, in cascade order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Facet {
    Division,
    SalesOffice,
    Warehouse,
    Supervisor,
    Region,
}

impl Facet {
    /// Fixed cascade order, most general first.
    pub const CASCADE: [Facet; 5] = [
        Facet::Division,
        Facet::SalesOffice,
        Facet::Warehouse,
        Facet::Supervisor,
        Facet::Region,
    ];

    /// Facets strictly upstream of `self`.
    pub fn upstream(self) -> &'static [Facet] {
        let idx = CASCADE_ORDER
            .iter()
            .position(|f| *f == self)
            .unwrap_or_default();
        &CASCADE_ORDER[..idx]
    }

    /// Bind-parameter name used for this facet's equality clause.
    pub fn param_name(self) -> &'static str {
        match self {
            Self::Division => "division",
            Self::SalesOffice => "sales_office",
            Self::Warehouse => "warehouse",
            Self::Supervisor => "supervisor",
            Self::Region => "region",
        }
    }
}

static CASCADE_ORDER: [Facet; 5] = Facet::CASCADE;

impl std::fmt::Display for Facet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Division => write!(f, "division"),
            Self::SalesOffice => write!(f, "sales office"),
            Self::Warehouse => write!(f, "warehouse"),
            Self::Supervisor => write!(f, "supervisor"),
            Self::Region => write!(f, "region"),
        }
    }
}

/// A facet selection: the "All" sentinel or one concrete value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetValue {
    #[default]
    All,
    Value(String),
}

impl FacetValue {
    /// Parse operator input. Empty text and the sentinel itself mean "All".
    ///
    /// A leading `=` takes the rest literally, so a stored value spelled
    /// `All` is still selectable as `=All`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Some(literal) = trimmed.strip_prefix(LITERAL_PREFIX) {
            return Self::Value(literal.to_string());
        }
        if trimmed.is_empty() || trimmed == ALL_SENTINEL {
            Self::All
        } else {
            Self::Value(trimmed.to_string())
        }
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            Self::All => None,
            Self::Value(v) => Some(v),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl std::fmt::Display for FacetValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "{ALL_SENTINEL}"),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Inclusive calendar date range as the operator sees it. Queries turn the
/// end into an exclusive next-day bound.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Build a range, swapping the ends if they arrive reversed.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// Every representable date; clamps to whatever bounds it meets. Queries
    /// leave an open end unconstrained.
    pub fn unbounded() -> Self {
        Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    /// Clamp both ends into `bounds`.
    pub fn clamp_to(self, bounds: DateRange) -> Self {
        let start = self.start.clamp(bounds.start, bounds.end);
        let end = self.end.clamp(bounds.start, bounds.end);
        Self::new(start, end)
    }

    /// The start, unless it is open (`NaiveDate::MIN`).
    pub fn lower(&self) -> Option<NaiveDate> {
        (self.start != NaiveDate::MIN).then_some(self.start)
    }

    /// The end, unless it is open (`NaiveDate::MAX`).
    pub fn upper(&self) -> Option<NaiveDate> {
        (self.end != NaiveDate::MAX).then_some(self.end)
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

/// The operator's full filter chain. Later facets only narrow rows that
/// already satisfy earlier ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct FilterSelection {
    pub division: FacetValue,
    pub sales_office: FacetValue,
    pub warehouse: FacetValue,
    pub supervisor: FacetValue,
    pub region: FacetValue,
    pub date_range: DateRange,
}

impl FilterSelection {
    /// Every facet at "All", constrained only by `date_range`.
    pub fn all(date_range: DateRange) -> Self {
        Self {
            division: FacetValue::All,
            sales_office: FacetValue::All,
            warehouse: FacetValue::All,
            supervisor: FacetValue::All,
            region: FacetValue::All,
            date_range,
        }
    }

    pub fn get(&self, facet: Facet) -> &FacetValue {
        match facet {
            Facet::Division => &self.division,
            Facet::SalesOffice => &self.sales_office,
            Facet::Warehouse => &self.warehouse,
            Facet::Supervisor => &self.supervisor,
            Facet::Region => &self.region,
        }
    }

    pub fn set(&mut self, facet: Facet, value: FacetValue) {
        match facet {
            Facet::Division => self.division = value,
            Facet::SalesOffice => self.sales_office = value,
            Facet::Warehouse => self.warehouse = value,
            Facet::Supervisor => self.supervisor = value,
            Facet::Region => self.region = value,
        }
    }

    pub fn with(mut self, facet: Facet, value: impl Into<String>) -> Self {
        self.set(facet, FacetValue::Value(value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// Bound parameters
// ---------------------------------------------------------------------------

/// A value bound to a named SQL parameter. Never rendered into SQL text.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SqlValue {
    Text(String),
    Int(i64),
    Date(NaiveDate),
}

/// Named bind parameters, without the leading `:`.
pub type NamedParams = Vec<(String, SqlValue)>;

impl std::fmt::Display for SqlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One typed cell of a fetched row.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Null,
    Int(i64),
    Real(f64),
    Text(String),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Numeric view; text is parsed as-is (no stripping).
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(*i as f64),
            Self::Real(r) if r.is_finite() => Some(*r),
            Self::Real(_) => None,
            Self::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }

    /// Text view. Whole reals render without a fractional part so a code
    /// stored as `900123.0` still reads as `900123`.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Int(i) => Some(i.to_string()),
            Self::Real(r) if r.fract() == 0.0 && r.abs() < 1e15 => Some(format!("{}", *r as i64)),
            Self::Real(r) => Some(r.to_string()),
            Self::Text(s) => Some(s.clone()),
        }
    }
}

/// A fetched row keyed by column name.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReportRow {
    pub cells: BTreeMap<String, Cell>,
}

impl ReportRow {
    pub fn get(&self, column: &str) -> &Cell {
        static NULL: Cell = Cell::Null;
        self.cells.get(column).unwrap_or(&NULL)
    }

    /// Numeric value of `column`, or `None` when the column is absent.
    pub fn number(&self, column: Option<&str>) -> Option<f64> {
        column.and_then(|c| self.get(c).as_f64())
    }
}

/// Ordered rows plus the ordered column list they were projected with.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<ReportRow>,
}

impl RowSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn upstream_is_strict_prefix_of_cascade() {
        assert!(Facet::Division.upstream().is_empty());
        assert_eq!(Facet::SalesOffice.upstream(), &[Facet::Division]);
        assert_eq!(
            Facet::Region.upstream(),
            &[
                Facet::Division,
                Facet::SalesOffice,
                Facet::Warehouse,
                Facet::Supervisor
            ]
        );
    }

    #[test]
    fn facet_value_parse_treats_sentinel_and_blank_as_all() {
        assert_eq!(FacetValue::parse("All"), FacetValue::All);
        assert_eq!(FacetValue::parse("  "), FacetValue::All);
        assert_eq!(
            FacetValue::parse(" North "),
            FacetValue::Value("North".into())
        );
        // Sentinel matching is exact.
        assert_eq!(FacetValue::parse("all"), FacetValue::Value("all".into()));
    }

    #[test]
    fn facet_value_parse_escapes_a_literal_all() {
        assert_eq!(FacetValue::parse("=All"), FacetValue::Value("All".into()));
        assert_eq!(FacetValue::parse(" =North"), FacetValue::Value("North".into()));
        assert_eq!(FacetValue::parse("==x"), FacetValue::Value("=x".into()));
    }

    #[test]
    fn date_range_swaps_reversed_ends() {
        let r = DateRange::new(d(2024, 3, 5), d(2024, 3, 1));
        assert_eq!(r.start, d(2024, 3, 1));
        assert_eq!(r.end, d(2024, 3, 5));
    }

    #[test]
    fn date_range_clamp() {
        let bounds = DateRange::new(d(2024, 1, 1), d(2024, 1, 31));
        let held = DateRange::new(d(2023, 12, 1), d(2024, 2, 10));
        assert_eq!(held.clamp_to(bounds), bounds);

        let inside = DateRange::new(d(2024, 1, 5), d(2024, 1, 6));
        assert_eq!(inside.clamp_to(bounds), inside);
    }

    #[test]
    fn cell_text_view_drops_whole_fraction() {
        assert_eq!(Cell::Real(900123.0).as_text().as_deref(), Some("900123"));
        assert_eq!(Cell::Int(100045).as_text().as_deref(), Some("100045"));
        assert_eq!(Cell::Null.as_text(), None);
    }

    #[test]
    fn cell_numeric_view() {
        assert_eq!(Cell::Text(" 12.5 ".into()).as_f64(), Some(12.5));
        assert_eq!(Cell::Text("abc".into()).as_f64(), None);
        assert_eq!(Cell::Real(f64::NAN).as_f64(), None);
    }

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert_eq!(token.check(), Err(AnalyticsError::Cancelled));
    }

    #[test]
    fn fetched_collects_failures() {
        let mut sink = Vec::new();
        let ok: Fetched<u8> = Fetched::ok(1);
        let bad = Fetched::degraded(
            0u8,
            QueryFailure::new(
                Operation::RowCount,
                &AnalyticsError::query(Operation::RowCount, "boom"),
            ),
        );
        assert_eq!(ok.collect_into(&mut sink), 1);
        assert_eq!(bad.collect_into(&mut sink), 0);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink[0].operation, Operation::RowCount);
    }
}
