//! Parameterized WHERE clauses from a [`FilterSelection`].
//!
//! Filter values only ever travel as bound parameters. The SQL text carries
//! nothing but resolved column identifiers (quoted by the dialect) and fixed
//! parameter names, so two selections that differ only in values render the
//! same text.

use chrono::Days;
use serde::Serialize;

use super::dialect::Dialect;
use super::schema::{Dimension, FunnelColumn, FunnelSchema, SchemaMap};
use super::types::*;

/// Bind name for the inclusive start date.
pub const START_PARAM: &str = "start";
/// Bind name for the exclusive day-after-end date.
pub const END_NEXT_PARAM: &str = "end_next";

/// Condition fragments joined with `AND`, plus their bound values.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Predicate {
    clauses: Vec<String>,
    params: NamedParams,
}

impl Predicate {
    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    pub fn params(&self) -> &NamedParams {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// ` WHERE a AND b`, or the empty string when unconstrained.
    pub fn where_sql(&self) -> String {
        if self.clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clauses.join(" AND "))
        }
    }

    /// Add a value-free clause (e.g. a NOT NULL guard).
    pub fn and(mut self, clause: impl Into<String>) -> Self {
        self.clauses.push(clause.into());
        self
    }

    /// Parameters plus one extra binding.
    pub fn params_with(&self, name: &str, value: SqlValue) -> NamedParams {
        let mut params = self.params.clone();
        params.push((name.to_string(), value));
        params
    }

    fn push_eq(&mut self, dialect: Dialect, column: &str, param: &str, value: &str) {
        self.clauses
            .push(format!("{} = :{param}", dialect.quote_ident(column)));
        self.params
            .push((param.to_string(), SqlValue::Text(value.to_string())));
    }

    fn push_date_range(&mut self, dialect: Dialect, column: &str, range: DateRange) {
        let col = dialect.quote_ident(column);
        if let Some(start) = range.lower() {
            self.clauses.push(format!("{col} >= :{START_PARAM}"));
            self.params
                .push((START_PARAM.to_string(), SqlValue::Date(start)));
        }
        // The day after the last representable date is unbounded too.
        if let Some(end_next) = range.upper().and_then(|end| end.checked_add_days(Days::new(1))) {
            self.clauses.push(format!("{col} < :{END_NEXT_PARAM}"));
            self.params
                .push((END_NEXT_PARAM.to_string(), SqlValue::Date(end_next)));
        }
    }
}

fn push_facets(
    predicate: &mut Predicate,
    facets: &[Facet],
    selection: &FilterSelection,
    schema: &SchemaMap,
    dialect: Dialect,
) {
    for facet in facets {
        let (Some(value), Some(column)) = (
            selection.get(*facet).as_value(),
            schema.column(Dimension::of_facet(*facet)),
        ) else {
            continue;
        };
        predicate.push_eq(dialect, column, facet.param_name(), value);
    }
}

/// Full predicate: every non-"All" available facet plus the date range.
pub fn build(selection: &FilterSelection, schema: &SchemaMap, dialect: Dialect) -> Predicate {
    let mut predicate = Predicate::default();
    push_facets(&mut predicate, &Facet::CASCADE, selection, schema, dialect);
    if let Some(column) = schema.column(Dimension::SalesDate) {
        predicate.push_date_range(dialect, column, selection.date_range);
    }
    predicate
}

/// Predicate for `facet`'s option list: only the facets strictly upstream of
/// it. The date range is not part of the cascade.
pub fn build_upstream(
    facet: Facet,
    selection: &FilterSelection,
    schema: &SchemaMap,
    dialect: Dialect,
) -> Predicate {
    let mut predicate = Predicate::default();
    push_facets(&mut predicate, facet.upstream(), selection, schema, dialect);
    predicate
}

/// Predicate for the date-bounds query: every facet, no date clause.
pub fn build_non_date(
    selection: &FilterSelection,
    schema: &SchemaMap,
    dialect: Dialect,
) -> Predicate {
    let mut predicate = Predicate::default();
    push_facets(&mut predicate, &Facet::CASCADE, selection, schema, dialect);
    predicate
}

/// Funnel-totals predicate: date range, division, sales office and region.
pub fn build_funnel(
    selection: &FilterSelection,
    schema: &FunnelSchema,
    dialect: Dialect,
) -> Predicate {
    let mut predicate = Predicate::default();
    let org = [
        (Facet::Division, FunnelColumn::Division),
        (Facet::SalesOffice, FunnelColumn::SalesOffice),
        (Facet::Region, FunnelColumn::Region),
    ];
    for (facet, key) in org {
        if let (Some(value), Some(column)) =
            (selection.get(facet).as_value(), schema.column(key))
        {
            predicate.push_eq(dialect, column, facet.param_name(), value);
        }
    }
    if let Some(column) = schema.column(FunnelColumn::SalesDate) {
        predicate.push_date_range(dialect, column, selection.date_range);
    }
    predicate
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
