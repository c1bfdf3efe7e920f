//! Cascading facet option lists and the date-bounds query.
//!
//! Every option list is computed from the facets strictly upstream of the one
//! being listed, never from itself or anything below it, so the chain stays
//! acyclic and picking "All" upstream always restores the full superset.

use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;

use super::dialect::Dialect;
use super::predicate;
use super::schema::{Dimension, SchemaMap};
use super::store::FactStore;
use super::types::*;

/// Distinct non-empty values of `facet` under its upstream selections,
/// ordinal-sorted (byte order, case-sensitive, locale-independent).
///
/// An unavailable facet has no options.
pub fn distinct_values<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    facet: Facet,
    selection: &FilterSelection,
    ctx: &RequestContext,
) -> AnalyticsResult<Vec<String>> {
    let Some(column) = schema.column(Dimension::of_facet(facet)) else {
        return Ok(Vec::new());
    };
    let dialect = store.dialect();
    let col = dialect.quote_ident(column);
    let predicate = predicate::build_upstream(facet, selection, schema, dialect)
        .and(format!("{col} IS NOT NULL"));
    let sql = format!(
        "SELECT DISTINCT {col} AS v FROM {}{}",
        dialect.table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql()
    );

    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::FacetOptions(facet)))?;
    Ok(raw
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Cell::as_text))
        .filter(|v| !v.trim().is_empty())
        .sorted()
        .dedup()
        .collect())
}

/// Prepend the "All" sentinel.
pub fn with_all(options: &[String]) -> Vec<String> {
    std::iter::once(ALL_SENTINEL.to_string())
        .chain(options.iter().cloned())
        .collect()
}

/// Read a date from a catalog cell (`YYYY-MM-DD`, optionally followed by a
/// time part).
pub fn cell_date(cell: &Cell) -> Option<NaiveDate> {
    let text = cell.as_text()?;
    let head = text.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// `[min, max]` calendar dates of the rows matching every facet of
/// `selection` (the date range itself is ignored).
///
/// `None` means no row carried a readable date.
pub fn date_bounds<S: FactStore + ?Sized>(
    store: &S,
    schema: &SchemaMap,
    selection: &FilterSelection,
    ctx: &RequestContext,
) -> AnalyticsResult<Option<DateRange>> {
    let Some(column) = schema.column(Dimension::SalesDate) else {
        return Ok(None);
    };
    let dialect: Dialect = store.dialect();
    let day = dialect.date_of(&dialect.quote_ident(column));
    let predicate = predicate::build_non_date(selection, schema, dialect);
    let sql = format!(
        "SELECT MIN({day}) AS min_d, MAX({day}) AS max_d FROM {}{}",
        dialect.table_ref(&schema.table, ctx.read_mode),
        predicate.where_sql()
    );

    let raw = store
        .query(&sql, predicate.params(), ctx)
        .map_err(|e| e.relabel(Operation::DateRange))?;
    let min = raw.first_value("min_d").and_then(cell_date);
    let max = raw.first_value("max_d").and_then(cell_date);
    Ok(match (min, max) {
        (Some(min), Some(max)) => Some(DateRange::new(min, max)),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

/// Keep `held` only if it is still offered.
pub fn reconcile_value(held: &FacetValue, options: &[String]) -> FacetValue {
    match held {
        FacetValue::Value(v) if options.iter().any(|o| o == v) => held.clone(),
        _ => FacetValue::All,
    }
}

/// One facet's control: the reconciled value and its option list.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FacetControl {
    pub facet: Facet,
    pub selected: FacetValue,
    /// "All" followed by the ascending distinct values.
    pub options: Vec<String>,
}

/// A held selection re-validated against fresh option lists.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterForm {
    pub selection: FilterSelection,
    pub controls: Vec<FacetControl>,
    /// Earliest and latest selectable dates.
    pub date_bounds: DateRange,
    pub failures: Vec<QueryFailure>,
}

impl FilterForm {
    pub fn control(&self, facet: Facet) -> Option<&FacetControl> {
        self.controls.iter().find(|c| c.facet == facet)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::dialect::TableName;
    use crate::analytics::schema::resolve_schema;
    use crate::analytics::store::SqliteStore;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn store() -> SqliteStore {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE SMI_Final (Divisi TEXT, AMO TEXT, WH_Name TEXT, Sales_Date TEXT);
             INSERT INTO SMI_Final VALUES ('B', 'south', 'W2', '2024-02-01');
             INSERT INTO SMI_Final VALUES ('A', 'North', 'W1', '2024-01-05 08:00:00');
             INSERT INTO SMI_Final VALUES ('A', 'north', 'W1', '2024-01-20');
             INSERT INTO SMI_Final VALUES ('A', 'North', NULL, '2024-01-21');
             INSERT INTO SMI_Final VALUES ('A', '', '  ', '2024-01-22');",
        )
        .unwrap();
        SqliteStore::from_connection(conn)
    }

    fn schema(store: &SqliteStore) -> SchemaMap {
        resolve_schema(
            store,
            &TableName::parse("SMI_Final").unwrap(),
            &RequestContext::default(),
        )
        .unwrap()
    }

    fn all() -> FilterSelection {
        FilterSelection::all(DateRange::single_day(d(2024, 1, 1)))
    }

    #[test]
    fn options_are_distinct_non_empty_and_ordinal_sorted() {
        let store = store();
        let schema = schema(&store);
        let offices =
            distinct_values(&store, &schema, Facet::SalesOffice, &all(), &RequestContext::default())
                .unwrap();
        // Upper case sorts before lower case in ordinal order.
        assert_eq!(offices, vec!["North", "north", "south"]);
    }

    #[test]
    fn options_follow_upstream_only() {
        let store = store();
        let schema = schema(&store);
        let sel = all()
            .with(Facet::Division, "B")
            .with(Facet::Warehouse, "W1");
        // Warehouse "W1" sits below sales office and must not filter it.
        let offices =
            distinct_values(&store, &schema, Facet::SalesOffice, &sel, &RequestContext::default())
                .unwrap();
        assert_eq!(offices, vec!["south"]);
    }

    #[test]
    fn unavailable_facet_has_no_options() {
        let store = store();
        let schema = schema(&store);
        let regions =
            distinct_values(&store, &schema, Facet::Region, &all(), &RequestContext::default()).unwrap();
        assert!(regions.is_empty());
        assert_eq!(with_all(&regions), vec!["All"]);
    }

    #[test]
    fn date_bounds_ignore_the_held_range() {
        let store = store();
        let schema = schema(&store);
        let sel = all().with(Facet::Division, "A");
        let bounds = date_bounds(&store, &schema, &sel, &RequestContext::default())
            .unwrap()
            .unwrap();
        assert_eq!(bounds, DateRange::new(d(2024, 1, 5), d(2024, 1, 22)));

        let none = all().with(Facet::Division, "Z");
        assert_eq!(
            date_bounds(&store, &schema, &none, &RequestContext::default()).unwrap(),
            None
        );
    }

    #[test]
    fn query_errors_name_the_facet() {
        let store = store();
        let mut schema = schema(&store);
        schema.table = TableName::parse("Missing").unwrap();
        let err = distinct_values(&store, &schema, Facet::Division, &all(), &RequestContext::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AnalyticsError::QueryFailed {
                operation: Operation::FacetOptions(Facet::Division),
                ..
            }
        ));
    }

    #[test]
    fn stale_pick_resets_to_all() {
        let options = vec!["A".to_string(), "B".to_string()];
        assert_eq!(
            reconcile_value(&FacetValue::Value("B".into()), &options),
            FacetValue::Value("B".into())
        );
        assert_eq!(
            reconcile_value(&FacetValue::Value("C".into()), &options),
            FacetValue::All
        );
        assert_eq!(reconcile_value(&FacetValue::All, &options), FacetValue::All);
    }

    #[test]
    fn cell_date_reads_datetime_prefix() {
        assert_eq!(
            cell_date(&Cell::Text("2024-01-05 08:00:00".into())),
            Some(d(2024, 1, 5))
        );
        assert_eq!(cell_date(&Cell::Text("junk".into())), None);
        assert_eq!(cell_date(&Cell::Null), None);
    }
}
