//! Sales-funnel and route-tracking report blocks.
//!
//! The funnel mixes two sources: NPL and volume figures come from the
//! fetched row set, while target calls, calls made, effective calls and sales
//! quantity come from the funnel totals table. The route summary prefers a
//! direct SQL aggregate over the full predicate and only falls back to the
//! (possibly capped) row set where the aggregate is missing.

use serde::Serialize;

use super::derive::{mean, safe_divide, travel_seconds_of, working_time};
use super::fetch::{FAKE_LIMIT, RADIUS_LIMIT_M};
use super::predicate;
use super::schema::{Dimension, FunnelColumn, FunnelSchema, SchemaMap};
use super::store::FactStore;
use super::types::*;

/// NPL packs strictly above this count as an NPL effective call.
pub const EC_NPL_MIN_PACKS: f64 = 1.0;

// ---------------------------------------------------------------------------
// Outlet classification
// ---------------------------------------------------------------------------

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutletClass {
    Registered,
    Dummy,
}

/// Dummy outlets have a customer code whose text starts with `9`. Empty and
/// missing codes are registered.
pub fn classify_outlet(code: &Cell) -> OutletClass {
    match code.as_text() {
        Some(text) if text.starts_with('9') => OutletClass::Dummy,
        _ => OutletClass::Registered,
    }
}

// ---------------------------------------------------------------------------
// Funnel
// ---------------------------------------------------------------------------

/// Per-bucket figures from the funnel totals table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct BucketTotals {
    pub target_call: f64,
    pub cm: f64,
    pub ec_total: f64,
    pub sales_qty: f64,
}

impl BucketTotals {
    fn add(self, other: Self) -> Self {
        Self {
            target_call: self.target_call + other.target_call,
            cm: self.cm + other.cm,
            ec_total: self.ec_total + other.ec_total,
            sales_qty: self.sales_qty + other.sales_qty,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct FunnelTotals {
    pub registered: BucketTotals,
    pub dummy: BucketTotals,
}

impl FunnelTotals {
    pub fn bucket(&self, class: OutletClass) -> BucketTotals {
        match class {
            OutletClass::Registered => self.registered,
            OutletClass::Dummy => self.dummy,
        }
    }
}

/// Query the funnel totals table, grouped by outlet class.
pub fn funnel_totals<S: FactStore + ?Sized>(
    store: &S,
    schema: &FunnelSchema,
    selection: &FilterSelection,
    ctx: &RequestContext,
) -> AnalyticsResult<FunnelTotals> {
    let measures = [
        FunnelColumn::TargetCall,
        FunnelColumn::CallMade,
        FunnelColumn::EffectiveCall,
        FunnelColumn::SalesQty,
    ];
    if measures.iter().all(|m| !schema.is_available(*m)) {
        return Ok(FunnelTotals::default());
    }

    let dialect = store.dialect();
    let sum = |key: FunnelColumn, alias: &str| match schema.column(key) {
        Some(col) => format!(
            "SUM({}) AS {alias}",
            dialect.try_number(&dialect.quote_ident(col))
        ),
        None => format!("0 AS {alias}"),
    };
    let bucket = schema.column(FunnelColumn::CustomerCode).map(|col| {
        format!(
            "CASE WHEN {} THEN 1 ELSE 0 END",
            dialect.leading_nine(&dialect.quote_ident(col))
        )
    });
    let group_by = bucket
        .as_ref()
        .map(|b| format!(" GROUP BY {b}"))
        .unwrap_or_default();
    let predicate = predicate::build_funnel(selection, schema, dialect);
    let sql = format!(
        "SELECT {} AS is_dummy, {}, {}, {}, {} FROM {}{}{}",
        bucket.as_deref().unwrap_or("0"),
        sum(FunnelColumn::TargetCall, "target_call"),
        sum(FunnelColumn::CallMade, "cm"),
        sum(FunnelColumn::EffectiveCall, "ec_total"),
        sum(FunnelColumn::SalesQty, "sales_qty"),
        dialect.table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql(),
        group_by,
    );

    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::FunnelTotals))?;
    let mut totals = FunnelTotals::default();
    for row in &raw.rows {
        let num = |i: usize| row.get(i).and_then(Cell::as_f64).unwrap_or(0.0);
        let bucket = BucketTotals {
            target_call: num(1),
            cm: num(2),
            ec_total: num(3),
            sales_qty: num(4),
        };
        if num(0) == 1.0 {
            totals.dummy = totals.dummy.add(bucket);
        } else {
            totals.registered = totals.registered.add(bucket);
        }
    }
    Ok(totals)
}

/// One column of the funnel table.
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct FunnelBucket {
    pub target_call: f64,
    pub cm: f64,
    pub ec_total: f64,
    pub ec_npl: u64,
    pub drop_size: f64,
    pub volume_total: f64,
    pub volume_npl: f64,
    pub sales_qty: f64,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct SalesFunnel {
    pub registered: FunnelBucket,
    pub dummy: FunnelBucket,
    pub total: FunnelBucket,
}

#[derive(Default)]
struct RowTally {
    ec_npl: u64,
    regular: f64,
    npl: f64,
}

fn bucket(tally: &RowTally, totals: BucketTotals) -> FunnelBucket {
    FunnelBucket {
        target_call: totals.target_call,
        cm: totals.cm,
        ec_total: totals.ec_total,
        ec_npl: tally.ec_npl,
        drop_size: safe_divide(totals.sales_qty, totals.ec_total),
        volume_total: tally.regular + tally.npl,
        volume_npl: tally.npl,
        sales_qty: totals.sales_qty,
    }
}

/// Build the funnel from the row set and the SQL totals.
///
/// Total is the elementwise sum of the two buckets, except drop size, which
/// is re-divided from the summed sales quantity and effective calls.
pub fn funnel(rows: &RowSet, schema: &SchemaMap, totals: &FunnelTotals) -> SalesFunnel {
    let code_col = schema.column(Dimension::CustomerCode);
    let regular_col = schema.column(Dimension::PackRegular);
    let npl_col = schema.column(Dimension::PackNpl);

    let mut registered = RowTally::default();
    let mut dummy = RowTally::default();
    for row in &rows.rows {
        let class = code_col.map_or(OutletClass::Registered, |c| classify_outlet(row.get(c)));
        let tally = match class {
            OutletClass::Registered => &mut registered,
            OutletClass::Dummy => &mut dummy,
        };
        let npl = row.number(npl_col);
        if npl.is_some_and(|v| v > EC_NPL_MIN_PACKS) {
            tally.ec_npl += 1;
        }
        tally.npl += npl.unwrap_or(0.0);
        tally.regular += row.number(regular_col).unwrap_or(0.0);
    }

    let registered = bucket(&registered, totals.registered);
    let dummy = bucket(&dummy, totals.dummy);
    let summed = totals.registered.add(totals.dummy);
    let total = FunnelBucket {
        target_call: registered.target_call + dummy.target_call,
        cm: registered.cm + dummy.cm,
        ec_total: registered.ec_total + dummy.ec_total,
        ec_npl: registered.ec_npl + dummy.ec_npl,
        drop_size: safe_divide(summed.sales_qty, summed.ec_total),
        volume_total: registered.volume_total + dummy.volume_total,
        volume_npl: registered.volume_npl + dummy.volume_npl,
        sales_qty: summed.sales_qty,
    };
    SalesFunnel {
        registered,
        dummy,
        total,
    }
}

// ---------------------------------------------------------------------------
// Route summary
// ---------------------------------------------------------------------------

/// Direct SQL aggregate over the full predicate.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteAggregate {
    pub first_visit: Option<String>,
    pub last_visit: Option<String>,
    pub fake_indication_count: u64,
    pub radius_over_threshold_count: u64,
    pub avg_distance: Option<f64>,
    pub avg_travel_seconds: Option<f64>,
}

pub fn route_aggregate<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    selection: &FilterSelection,
    ctx: &RequestContext,
) -> AnalyticsResult<RouteAggregate> {
    let dialect = store.dialect();
    let col = |dim: Dimension| schema.column(dim).map(|c| dialect.quote_ident(c));
    let over = |dim: Dimension, limit: f64| match col(dim) {
        Some(c) => format!(
            "SUM(CASE WHEN {} > {limit} THEN 1 ELSE 0 END)",
            dialect.try_number(&c)
        ),
        None => "0".to_string(),
    };

    let (first, last) = match col(Dimension::VisitTime) {
        Some(c) => (format!("MIN({c})"), format!("MAX({c})")),
        None => ("NULL".to_string(), "NULL".to_string()),
    };
    let avg_dist = col(Dimension::Distance)
        .map(|c| format!("AVG({})", dialect.try_number(&c)))
        .unwrap_or_else(|| "NULL".to_string());
    let avg_secs = col(Dimension::TravelTime)
        .map(|c| format!("AVG({})", dialect.time_to_seconds(&c)))
        .unwrap_or_else(|| "NULL".to_string());

    let predicate = predicate::build(selection, schema, dialect);
    let sql = format!(
        "SELECT {first} AS first_visit, {last} AS last_visit, \
         {} AS fake_cnt, {} AS radius_cnt, {avg_dist} AS avg_dist, {avg_secs} AS avg_secs \
         FROM {}{}",
        over(Dimension::FakeIndication, FAKE_LIMIT),
        over(Dimension::Radius, RADIUS_LIMIT_M),
        dialect.table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql()
    );

    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::RouteAggregate))?;
    let value = |name: &str| raw.first_value(name).cloned().unwrap_or_default();
    let count = |name: &str| value(name).as_f64().map_or(0, |n| n.max(0.0) as u64);
    Ok(RouteAggregate {
        first_visit: value("first_visit").as_text(),
        last_visit: value("last_visit").as_text(),
        fake_indication_count: count("fake_cnt"),
        radius_over_threshold_count: count("radius_cnt"),
        avg_distance: value("avg_dist").as_f64(),
        avg_travel_seconds: value("avg_secs").as_f64(),
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteSummary {
    pub first_visit: String,
    pub last_visit: String,
    /// `HH:MM:SS`, blank when either end is unknown.
    pub working_time: String,
    pub fake_indication_count: u64,
    pub avg_travel_seconds: Option<i64>,
    pub radius_over_threshold_count: u64,
    /// Meters, rounded.
    pub avg_distance: Option<i64>,
}

fn local_travel_average(rows: &RowSet, schema: &SchemaMap) -> Option<f64> {
    let col = schema.column(Dimension::TravelTime)?;
    mean(
        rows.rows
            .iter()
            .filter_map(|r| travel_seconds_of(r.get(col)))
            .map(|s| s as f64),
    )
}

fn count_over(rows: &RowSet, column: Option<&str>, limit: f64) -> u64 {
    rows.rows
        .iter()
        .filter(|r| r.number(column).is_some_and(|v| v > limit))
        .count() as u64
}

fn visit_extremes(rows: &RowSet, schema: &SchemaMap) -> (Option<String>, Option<String>) {
    let Some(col) = schema.column(Dimension::VisitTime) else {
        return (None, None);
    };
    let visits: Vec<String> = rows
        .rows
        .iter()
        .filter_map(|r| r.get(col).as_text())
        .filter(|t| !t.trim().is_empty())
        .collect();
    (visits.iter().min().cloned(), visits.iter().max().cloned())
}

/// Assemble the route summary. `aggregate` is `None` when the SQL aggregate
/// failed; the row set then stands in for every figure.
pub fn route_summary(
    rows: &RowSet,
    schema: &SchemaMap,
    aggregate: Option<&RouteAggregate>,
) -> RouteSummary {
    let (first, last, fake, radius, distance, sql_travel) = match aggregate {
        Some(agg) => (
            agg.first_visit.clone(),
            agg.last_visit.clone(),
            agg.fake_indication_count,
            agg.radius_over_threshold_count,
            agg.avg_distance,
            agg.avg_travel_seconds,
        ),
        None => {
            let (first, last) = visit_extremes(rows, schema);
            (
                first,
                last,
                count_over(rows, schema.column(Dimension::FakeIndication), FAKE_LIMIT),
                count_over(rows, schema.column(Dimension::Radius), RADIUS_LIMIT_M),
                mean(
                    rows.rows
                        .iter()
                        .filter_map(|r| r.number(schema.column(Dimension::Distance))),
                ),
                None,
            )
        }
    };

    let first = first.unwrap_or_default();
    let last = last.unwrap_or_default();
    let travel = sql_travel.or_else(|| local_travel_average(rows, schema));
    RouteSummary {
        working_time: working_time(&first, &last),
        first_visit: first,
        last_visit: last,
        fake_indication_count: fake,
        avg_travel_seconds: travel.map(|s| s.round() as i64),
        radius_over_threshold_count: radius,
        avg_distance: distance.map(|d| d.round() as i64),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
