//! The report engine facade.
//!
//! [`ReportEngine`] owns the store handle and one ttl cache per value class.
//! Every public operation returns a usable value: failures are caught here,
//! logged, and handed back next to an empty/default result so one failing
//! query never takes the whole filter form down.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::cache::{CacheKey, CacheStats, Clock, TtlCache};
use super::cascade::{self, FacetControl, FilterForm};
use super::dialect::TableName;
use super::fetch::{self, OutlierFlags};
use super::metrics::{self, FunnelTotals, RouteAggregate, RouteSummary, SalesFunnel};
use super::predicate::{self, Predicate};
use super::schema::{self, Dimension, FunnelSchema, SchemaMap};
use super::store::FactStore;
use super::types::*;

/// Tables, caps and ttls for one engine instance.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineOptions {
    pub fact_table: TableName,
    pub funnel_table: TableName,
    /// Preview cap used when the caller does not pass one.
    pub preview_row_cap: usize,
    /// Ceiling every requested cap is clamped to.
    pub max_row_cap: usize,
    /// Schema, facet-option and date-range entries.
    pub facet_ttl: Duration,
    /// Row, count and aggregate entries.
    pub data_ttl: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fact_table: TableName {
                schema: None,
                name: "SMI_Final".into(),
            },
            funnel_table: TableName {
                schema: None,
                name: "cmec".into(),
            },
            preview_row_cap: 60,
            max_row_cap: 60,
            facet_ttl: Duration::from_secs(15 * 60),
            data_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl EngineOptions {
    /// Clamp a requested preview cap into `[1, max_row_cap]`.
    pub fn clamp_cap(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.preview_row_cap)
            .clamp(1, self.max_row_cap.max(1))
    }
}

/// Everything one submission produced. Owned by the caller, who keeps it
/// until the next submission.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub selection: FilterSelection,
    pub rows: RowSet,
    /// Highlight flags, one per row of `rows`.
    pub outliers: Vec<OutlierFlags>,
    pub total_rows: u64,
    pub filtered_rows: u64,
    pub funnel: SalesFunnel,
    pub route: RouteSummary,
    pub failures: Vec<QueryFailure>,
}

impl Report {
    pub fn no_rows_matched(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

struct Caches {
    schema: TtlCache<SchemaMap>,
    funnel_schema: TtlCache<FunnelSchema>,
    options: TtlCache<Vec<String>>,
    date_range: TtlCache<Option<DateRange>>,
    rows: TtlCache<RowSet>,
    counts: TtlCache<u64>,
    route: TtlCache<RouteAggregate>,
    funnel_totals: TtlCache<FunnelTotals>,
}

impl Caches {
    fn new(options: &EngineOptions, clock: &Arc<dyn Clock>) -> Self {
        fn cache<V: Send + Sync>(
            name: &'static str,
            ttl: Duration,
            clock: &Arc<dyn Clock>,
        ) -> TtlCache<V> {
            TtlCache::new(name, ttl, Arc::clone(clock))
        }
        let (facet, data) = (options.facet_ttl, options.data_ttl);
        Self {
            schema: cache("schema", facet, clock),
            funnel_schema: cache("funnel_schema", facet, clock),
            options: cache("options", facet, clock),
            date_range: cache("date_range", facet, clock),
            rows: cache("rows", data, clock),
            counts: cache("counts", data, clock),
            route: cache("route", data, clock),
            funnel_totals: cache("funnel_totals", data, clock),
        }
    }
}

/// Cached, failure-tolerant access to the facet cascade, rows and metrics.
pub struct ReportEngine<S: FactStore> {
    store: Arc<S>,
    options: EngineOptions,
    clock: Arc<dyn Clock>,
    caches: Caches,
}

fn degrade<T>(
    operation: Operation,
    result: AnalyticsResult<T>,
    fallback: impl FnOnce() -> T,
) -> Fetched<T> {
    match result {
        Ok(value) => Fetched::ok(value),
        Err(err) => {
            warn!(operation = %operation, error = %err, "query failed; using empty result");
            Fetched::degraded(fallback(), QueryFailure::new(operation, &err))
        }
    }
}

impl<S: FactStore> ReportEngine<S> {
    pub fn new(store: Arc<S>, options: EngineOptions, clock: Arc<dyn Clock>) -> Self {
        let caches = Caches::new(&options, &clock);
        Self {
            store,
            options,
            clock,
            caches,
        }
    }

    pub fn settings(&self) -> &EngineOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // -- schema ------------------------------------------------------------

    /// Fact-table schema. A catalog failure yields the uncached fallback map
    /// plus a `SchemaUnavailable` failure, so the next call retries.
    pub fn schema(&self, ctx: &RequestContext) -> Fetched<Arc<SchemaMap>> {
        let table = &self.options.fact_table;
        let key = CacheKey::new("schema")
            .field("table", table)
            .read_mode(ctx.read_mode);
        let result = self.caches.schema.get_or_try_insert_with(&key, &ctx.cancel, || {
            schema::resolve_schema(self.store.as_ref(), table, ctx)
        });
        if let Ok(map) = &result
            && !map.unresolved().is_empty()
        {
            debug!(table = %table, unresolved = ?map.unresolved(), "dimensions unavailable");
        }
        degrade(Operation::Schema, result, || {
            Arc::new(schema::fallback_schema(table))
        })
    }

    pub fn funnel_schema(&self, ctx: &RequestContext) -> Fetched<Arc<FunnelSchema>> {
        let table = &self.options.funnel_table;
        let key = CacheKey::new("funnel_schema")
            .field("table", table)
            .read_mode(ctx.read_mode);
        let result = self
            .caches
            .funnel_schema
            .get_or_try_insert_with(&key, &ctx.cancel, || {
                schema::resolve_funnel_schema(self.store.as_ref(), table, ctx)
            });
        degrade(Operation::FunnelSchema, result, || {
            Arc::new(schema::fallback_funnel_schema(table))
        })
    }

    // -- cascade -----------------------------------------------------------

    /// Cached distinct values, or `None` when the facet has no column.
    fn cached_options(
        &self,
        schema: &SchemaMap,
        facet: Facet,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Option<AnalyticsResult<Arc<Vec<String>>>> {
        let column = schema.column(Dimension::of_facet(facet))?;
        let key = CacheKey::new("options")
            .field("table", &schema.table)
            .field("column", column)
            .facets(facet.upstream(), selection)
            .read_mode(ctx.read_mode);
        Some(self.caches.options.get_or_try_insert_with(&key, &ctx.cancel, || {
            cascade::distinct_values(self.store.as_ref(), schema, facet, selection, ctx)
        }))
    }

    fn options_with(
        &self,
        schema: &SchemaMap,
        facet: Facet,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<Vec<String>> {
        let Some(result) = self.cached_options(schema, facet, selection, ctx) else {
            return Fetched::ok(Vec::new());
        };
        degrade(Operation::FacetOptions(facet), result, Default::default)
            .map_value(|v| v.as_ref().clone())
    }

    /// Ascending distinct values of `facet` under its upstream selections.
    pub fn options(
        &self,
        facet: Facet,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<Vec<String>> {
        let schema = self.schema(ctx);
        let mut out = self.options_with(&schema.value, facet, selection, ctx);
        if out.failure.is_none() {
            out.failure = schema.failure;
        }
        out
    }

    /// [`Self::options`] with the "All" sentinel prepended.
    pub fn facet_options(
        &self,
        facet: Facet,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<Vec<String>> {
        let mut out = self.options(facet, selection, ctx);
        out.value = cascade::with_all(&out.value);
        out
    }

    fn date_range_with(
        &self,
        schema: &SchemaMap,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<DateRange> {
        let today = DateRange::single_day(self.clock.today());
        let Some(column) = schema.column(Dimension::SalesDate) else {
            return Fetched::ok(today);
        };
        let key = CacheKey::new("date_range")
            .field("table", &schema.table)
            .field("column", column)
            .facets(&Facet::CASCADE, selection)
            .read_mode(ctx.read_mode);
        let result = self.caches.date_range.get_or_try_insert_with(&key, &ctx.cancel, || {
            cascade::date_bounds(self.store.as_ref(), schema, selection, ctx)
        });
        degrade(Operation::DateRange, result, || Arc::new(None))
            .map_value(|bounds| (*bounds).unwrap_or(today))
    }

    /// `[min, max]` sales dates under every facet of `selection`; today's date
    /// on both ends when nothing is known.
    pub fn date_range(&self, selection: &FilterSelection, ctx: &RequestContext) -> Fetched<DateRange> {
        let schema = self.schema(ctx);
        self.date_range_with(&schema.value, selection, ctx)
    }

    /// Re-validate a held selection top-down against fresh option lists.
    ///
    /// Option lists for the held picks are warmed in parallel first; the
    /// sequential walk then only misses the cache below a reset pick.
    pub fn reconcile(&self, held: &FilterSelection, ctx: &RequestContext) -> FilterForm {
        let mut failures = Vec::new();
        let schema = self.schema(ctx).collect_into(&mut failures);

        // Warm-up only fills the cache; the walk below reports failures.
        Facet::CASCADE.par_iter().for_each(|facet| {
            if let Some(Err(err)) = self.cached_options(&schema, *facet, held, ctx) {
                debug!(facet = %facet, error = %err, "warm-up miss");
            }
        });

        let mut selection = FilterSelection::all(held.date_range);
        let mut controls = Vec::with_capacity(Facet::CASCADE.len());
        for facet in Facet::CASCADE {
            let options = self
                .options_with(&schema, facet, &selection, ctx)
                .collect_into(&mut failures);
            let selected = cascade::reconcile_value(held.get(facet), &options);
            if selected != *held.get(facet) {
                debug!(facet = %facet, held = %held.get(facet), "held pick no longer offered");
            }
            selection.set(facet, selected.clone());
            controls.push(FacetControl {
                facet,
                selected,
                options: cascade::with_all(&options),
            });
        }

        let bounds = self
            .date_range_with(&schema, &selection, ctx)
            .collect_into(&mut failures);
        selection.date_range = held.date_range.clamp_to(bounds);
        FilterForm {
            selection,
            controls,
            date_bounds: bounds,
            failures,
        }
    }

    // -- rows --------------------------------------------------------------

    fn rows_with(
        &self,
        schema: &SchemaMap,
        selection: &FilterSelection,
        cap: Option<usize>,
        ctx: &RequestContext,
    ) -> Fetched<Arc<RowSet>> {
        let mut key = CacheKey::new("rows")
            .field("table", &schema.table)
            .field("degraded", u8::from(schema.degraded))
            .facets(&Facet::CASCADE, selection)
            .date_range(selection.date_range);
        key = match cap {
            Some(cap) => key.field("cap", cap),
            None => key.field("cap", "none"),
        };
        let key = key.read_mode(ctx.read_mode);
        let (operation, result) = match cap {
            Some(cap) => (
                Operation::PreviewRows,
                self.caches.rows.get_or_try_insert_with(&key, &ctx.cancel, || {
                    fetch::fetch_bounded(self.store.as_ref(), schema, selection, cap, ctx)
                }),
            ),
            None => (
                Operation::ExportRows,
                self.caches.rows.get_or_try_insert_with(&key, &ctx.cancel, || {
                    fetch::fetch_all(self.store.as_ref(), schema, selection, ctx)
                }),
            ),
        };
        degrade(operation, result, Default::default)
    }

    /// Newest-first preview. `cap` is clamped into `[1, max_row_cap]`.
    pub fn fetch_bounded(
        &self,
        selection: &FilterSelection,
        cap: Option<usize>,
        ctx: &RequestContext,
    ) -> Fetched<Arc<RowSet>> {
        let schema = self.schema(ctx);
        let cap = self.options.clamp_cap(cap);
        self.rows_with(&schema.value, selection, Some(cap), ctx)
    }

    /// Every matching row, for export.
    pub fn fetch_all(&self, selection: &FilterSelection, ctx: &RequestContext) -> Fetched<Arc<RowSet>> {
        let schema = self.schema(ctx);
        self.rows_with(&schema.value, selection, None, ctx)
    }

    fn count_with(
        &self,
        schema: &SchemaMap,
        scope: Option<&FilterSelection>,
        ctx: &RequestContext,
    ) -> Fetched<u64> {
        let key = CacheKey::new("count").field("table", &schema.table);
        let (key, predicate) = match scope {
            Some(selection) => (
                key.field("degraded", u8::from(schema.degraded))
                    .facets(&Facet::CASCADE, selection)
                    .date_range(selection.date_range),
                predicate::build(selection, schema, self.store.dialect()),
            ),
            None => (key.field("scope", "all"), Predicate::default()),
        };
        let key = key.read_mode(ctx.read_mode);
        let result = self.caches.counts.get_or_try_insert_with(&key, &ctx.cancel, || {
            fetch::count(self.store.as_ref(), schema, &predicate, ctx)
        });
        degrade(Operation::RowCount, result, || Arc::new(0)).map_value(|n| *n)
    }

    /// Rows matching `selection`.
    pub fn count_rows(&self, selection: &FilterSelection, ctx: &RequestContext) -> Fetched<u64> {
        let schema = self.schema(ctx);
        self.count_with(&schema.value, Some(selection), ctx)
    }

    /// Rows in the whole fact table.
    pub fn count_all(&self, ctx: &RequestContext) -> Fetched<u64> {
        let schema = self.schema(ctx);
        self.count_with(&schema.value, None, ctx)
    }

    // -- metrics -----------------------------------------------------------

    fn funnel_totals_with(
        &self,
        schema: &FunnelSchema,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<FunnelTotals> {
        let key = CacheKey::new("funnel_totals")
            .field("table", &schema.table)
            .facet(Facet::Division, &selection.division)
            .facet(Facet::SalesOffice, &selection.sales_office)
            .facet(Facet::Region, &selection.region)
            .date_range(selection.date_range)
            .read_mode(ctx.read_mode);
        let result = self
            .caches
            .funnel_totals
            .get_or_try_insert_with(&key, &ctx.cancel, || {
                metrics::funnel_totals(self.store.as_ref(), schema, selection, ctx)
            });
        degrade(Operation::FunnelTotals, result, Default::default).map_value(|t| *t)
    }

    fn route_aggregate_with(
        &self,
        schema: &SchemaMap,
        selection: &FilterSelection,
        ctx: &RequestContext,
    ) -> Fetched<Option<Arc<RouteAggregate>>> {
        let key = CacheKey::new("route")
            .field("table", &schema.table)
            .field("degraded", u8::from(schema.degraded))
            .facets(&Facet::CASCADE, selection)
            .date_range(selection.date_range)
            .read_mode(ctx.read_mode);
        let result = self.caches.route.get_or_try_insert_with(&key, &ctx.cancel, || {
            metrics::route_aggregate(self.store.as_ref(), schema, selection, ctx)
        });
        degrade(Operation::RouteAggregate, result.map(Some), || None)
    }

    /// Sales funnel for `selection` over an already fetched row set.
    pub fn funnel(
        &self,
        selection: &FilterSelection,
        rows: &RowSet,
        ctx: &RequestContext,
    ) -> Fetched<SalesFunnel> {
        let schema = self.schema(ctx);
        let funnel_schema = self.funnel_schema(ctx);
        let mut out = self
            .funnel_totals_with(&funnel_schema.value, selection, ctx)
            .map_value(|totals| metrics::funnel(rows, &schema.value, &totals));
        if out.failure.is_none() {
            out.failure = funnel_schema.failure;
        }
        out
    }

    /// Route summary for `selection`, with `rows` as the fallback source.
    pub fn route_summary(
        &self,
        selection: &FilterSelection,
        rows: &RowSet,
        ctx: &RequestContext,
    ) -> Fetched<RouteSummary> {
        let schema = self.schema(ctx);
        self.route_aggregate_with(&schema.value, selection, ctx)
            .map_value(|agg| metrics::route_summary(rows, &schema.value, agg.as_deref()))
    }

    // -- submission --------------------------------------------------------

    /// Run one filter submission: preview rows, counts and both aggregates,
    /// issued in parallel once the schemas are known.
    pub fn submit(&self, selection: &FilterSelection, cap: Option<usize>, ctx: &RequestContext) -> Report {
        let started = Instant::now();
        let mut failures = Vec::new();
        let schema = self.schema(ctx).collect_into(&mut failures);
        let funnel_schema = self.funnel_schema(ctx).collect_into(&mut failures);
        let cap = self.options.clamp_cap(cap);

        let (rows, ((total, filtered), (route, totals))) = rayon::join(
            || self.rows_with(&schema, selection, Some(cap), ctx),
            || {
                rayon::join(
                    || {
                        rayon::join(
                            || self.count_with(&schema, None, ctx),
                            || self.count_with(&schema, Some(selection), ctx),
                        )
                    },
                    || {
                        rayon::join(
                            || self.route_aggregate_with(&schema, selection, ctx),
                            || self.funnel_totals_with(&funnel_schema, selection, ctx),
                        )
                    },
                )
            },
        );

        let rows = rows.collect_into(&mut failures);
        let total_rows = total.collect_into(&mut failures);
        let filtered_rows = filtered.collect_into(&mut failures);
        let route = route.collect_into(&mut failures);
        let totals = totals.collect_into(&mut failures);

        let funnel = metrics::funnel(&rows, &schema, &totals);
        let route = metrics::route_summary(&rows, &schema, route.as_deref());
        let outliers = rows
            .rows
            .iter()
            .map(|row| fetch::outlier_flags(row, &schema))
            .collect();

        info!(
            rows = rows.len(),
            filtered_rows,
            failures = failures.len(),
            dirty = ctx.read_mode.is_dirty(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "report built"
        );
        Report {
            selection: selection.clone(),
            rows: rows.as_ref().clone(),
            outliers,
            total_rows,
            filtered_rows,
            funnel,
            route,
            failures,
        }
    }

    // -- maintenance -------------------------------------------------------

    /// Abandon `ctx`'s request: waiting queries give up, running ones are
    /// interrupted, and nothing they produce is cached. Other requests are
    /// untouched.
    pub fn cancel(&self, ctx: &RequestContext) {
        ctx.cancel.cancel();
        self.store.interrupt(&ctx.cancel);
        debug!("request cancelled");
    }

    pub fn invalidate_all(&self) {
        let c = &self.caches;
        c.schema.invalidate_all();
        c.funnel_schema.invalidate_all();
        c.options.invalidate_all();
        c.date_range.invalidate_all();
        c.rows.invalidate_all();
        c.counts.invalidate_all();
        c.route.invalidate_all();
        c.funnel_totals.invalidate_all();
        debug!("all caches invalidated");
    }

    /// Per-class cache counters, by class name.
    pub fn cache_stats(&self) -> Vec<(&'static str, &CacheStats)> {
        let c = &self.caches;
        vec![
            ("schema", c.schema.stats()),
            ("funnel_schema", c.funnel_schema.stats()),
            ("options", c.options.stats()),
            ("date_range", c.date_range.stats()),
            ("rows", c.rows.stats()),
            ("counts", c.counts.stats()),
            ("route", c.route.stats()),
            ("funnel_totals", c.funnel_totals.stats()),
        ]
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
