//! Row fetches against the fact table.
//!
//! The projection is a fixed list of report columns filtered down to the ones
//! the live table actually has. Free-text measure columns are stripped and
//! coerced to nullable numbers on the way out.

use serde::Serialize;

use super::derive::coerce_numeric;
use super::dialect::CAP_PARAM;
use super::predicate::{self, Predicate};
use super::schema::{Dimension, SchemaMap};
use super::store::{FactStore, RawRows};
use super::types::*;

/// Distance above which a visit is flagged, in meters.
pub const DISTANCE_LIMIT_M: f64 = 2000.0;
/// Radius above which a visit is flagged, in meters.
pub const RADIUS_LIMIT_M: f64 = 300.0;
/// Fake-indication score above which a visit is flagged.
pub const FAKE_LIMIT: f64 = 1.0;

#[derive(Copy, Clone, Debug)]
enum ReportColumn {
    /// Taken by exact name when present.
    Named(&'static str),
    /// Taken under whatever name the schema resolved.
    Resolved(Dimension),
}

use ReportColumn::{Named, Resolved};

const REPORT_COLUMNS: &[ReportColumn] = &[
    Named("Sequence"),
    Resolved(Dimension::VisitTime),
    Named("Latitude"),
    Named("Longitude"),
    Resolved(Dimension::CustomerCode),
    Named("Store_Name"),
    Named("Visit_Div_"),
    Resolved(Dimension::PackRegular),
    Resolved(Dimension::PackNpl),
    Resolved(Dimension::TravelTime),
    Resolved(Dimension::Distance),
    Resolved(Dimension::Radius),
    Named("Google_Maps"),
    Resolved(Dimension::FakeIndication),
    Named("Outlet_Address"),
    Named("Outlet_Latitude"),
    Named("Outlet_Longitude"),
    // map overlay coordinates
    Named("MNT_Latitude"),
    Named("Latitude_MNT"),
    Named("MNT_Lat"),
    Named("Lat_MNT"),
    Named("MNTLatitude"),
    Named("MNT_Longitude"),
    Named("Longitude_MNT"),
    Named("MNT_Long"),
    Named("Lon_MNT"),
    Named("Long_MNT"),
    Named("MNTLongitude"),
];

/// The report projection for `schema`, in display order, without repeats.
pub fn report_columns(schema: &SchemaMap) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for col in REPORT_COLUMNS {
        let name = match col {
            Named(name) => schema.has_column(name).then(|| name.to_string()),
            Resolved(dim) => schema.column(*dim).map(str::to_string),
        };
        if let Some(name) = name
            && !out.contains(&name)
        {
            out.push(name);
        }
    }
    out
}

/// Column the preview is ordered by: the sales date, else the visit time.
pub fn order_column(schema: &SchemaMap) -> Option<&str> {
    schema
        .column(Dimension::SalesDate)
        .or_else(|| schema.column(Dimension::VisitTime))
}

fn select_sql<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    predicate: &Predicate,
    ctx: &RequestContext,
) -> AnalyticsResult<String> {
    let columns = report_columns(schema);
    if columns.is_empty() {
        return Err(AnalyticsError::NoReportColumns(schema.table.to_string()));
    }
    let dialect = store.dialect();
    let select_list = columns
        .iter()
        .map(|c| dialect.quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "SELECT {select_list} FROM {}{}",
        dialect.table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql()
    ))
}

/// Replace the free-text measure cells with coerced numbers.
pub fn coerce_rows(raw: RawRows, schema: &SchemaMap) -> RowSet {
    let mut rows = raw.into_row_set();
    let numeric: Vec<&str> = Dimension::NUMERIC_TEXT
        .iter()
        .filter_map(|dim| schema.column(*dim))
        .collect();
    for row in &mut rows.rows {
        for col in &numeric {
            if let Some(cell) = row.cells.get_mut(*col) {
                *cell = coerce_numeric(cell);
            }
        }
    }
    rows
}

/// Newest-first preview of at most `cap` rows.
pub fn fetch_bounded<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    selection: &FilterSelection,
    cap: usize,
    ctx: &RequestContext,
) -> AnalyticsResult<RowSet> {
    if cap == 0 {
        return Err(AnalyticsError::InvalidRowCap(cap));
    }
    let dialect = store.dialect();
    let predicate = predicate::build(selection, schema, dialect);
    let sql = select_sql(store, schema, &predicate, ctx)?
        + &dialect.paginate(order_column(schema));
    let cap = i64::try_from(cap).unwrap_or(i64::MAX);
    let params = predicate.params_with(CAP_PARAM, SqlValue::Int(cap));
    let raw = store
        .query(&sql, &params, ctx)
        .map_err(|e| e.relabel(Operation::PreviewRows))?;
    Ok(coerce_rows(raw, schema))
}

/// Every matching row, in storage order.
pub fn fetch_all<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    selection: &FilterSelection,
    ctx: &RequestContext,
) -> AnalyticsResult<RowSet> {
    let predicate = predicate::build(selection, schema, store.dialect());
    let sql = select_sql(store, schema, &predicate, ctx)?;
    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::ExportRows))?;
    Ok(coerce_rows(raw, schema))
}

/// Number of rows matching `predicate` (or the whole table when empty).
pub fn count<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    predicate: &Predicate,
    ctx: &RequestContext,
) -> AnalyticsResult<u64> {
    let sql = format!(
        "SELECT COUNT(*) AS n FROM {}{}",
        store.dialect().table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql()
    );
    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::RowCount))?;
    Ok(raw
        .scalar()
        .and_then(Cell::as_f64)
        .map(|n| n.max(0.0) as u64)
        .unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Outliers
// ---------------------------------------------------------------------------

/// Cells a renderer should highlight for one row.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutlierFlags {
    pub npl_zero: bool,
    pub distance_over_limit: bool,
    pub radius_over_limit: bool,
    pub fake_indicated: bool,
}

impl OutlierFlags {
    pub fn any(&self) -> bool {
        self.npl_zero || self.distance_over_limit || self.radius_over_limit || self.fake_indicated
    }
}

pub fn outlier_flags(row: &ReportRow, schema: &SchemaMap) -> OutlierFlags {
    let value = |dim: Dimension| row.number(schema.column(dim));
    OutlierFlags {
        npl_zero: value(Dimension::PackNpl) == Some(0.0),
        distance_over_limit: value(Dimension::Distance).is_some_and(|v| v > DISTANCE_LIMIT_M),
        radius_over_limit: value(Dimension::Radius).is_some_and(|v| v > RADIUS_LIMIT_M),
        fake_indicated: value(Dimension::FakeIndication).is_some_and(|v| v > FAKE_LIMIT),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
