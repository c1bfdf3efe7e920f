mod util;

use smart_report::analytics::{DateRange, Facet, FilterSelection, Operation, RequestContext};
use util::{FailingStore, TestTracing, Visit, day, engine_over, memory_store};

#[test]
fn failing_facet_warns_once_per_reconcile() {
    let tracing = TestTracing::new();
    tracing.install_global();

    let visits = vec![
        Visit::new("Retail", "North", day(2024, 3, 1)),
        Visit::new("Horeca", "East", day(2024, 3, 1)).org("WH-2", "Budi", "R2"),
    ];
    let store = FailingStore::new(memory_store(&visits, &[])).fail_on("SELECT DISTINCT \"WH_Name\"");
    let engine = engine_over(store, day(2024, 6, 1));
    let held = FilterSelection::all(DateRange::single_day(day(2024, 3, 1)))
        .with(Facet::Warehouse, "WH-1");

    let form = engine.reconcile(&held, &RequestContext::default());
    let reported = form
        .failures
        .iter()
        .filter(|f| f.operation == Operation::FacetOptions(Facet::Warehouse))
        .count();
    assert_eq!(reported, 1);

    let out = tracing.output();
    let warnings = out
        .lines()
        .filter(|l| l.contains("query failed; using empty result"))
        .count();
    assert_eq!(warnings, 1, "{out}");
    tracing.assert_contains("warm-up miss");
}
