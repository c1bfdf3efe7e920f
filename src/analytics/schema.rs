//! Column discovery for loosely-specified tables.
//!
//! Each logical column carries an ordered alias list. Resolution matches the
//! aliases case-insensitively against the live column catalog and binds the
//! first hit; anything without a hit is [`ColumnBinding::Unavailable`] for the
//! lifetime of that snapshot and behaves as an always-"All" dimension.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::Serialize;

use super::dialect::TableName;
use super::store::FactStore;
use super::types::*;

/// Columns assumed to exist when the catalog cannot be read.
pub const FALLBACK_FACT_COLUMNS: &[&str] = &[
    "Sequence",
    "Visit_Time",
    "Latitude",
    "Longitude",
    "Customer_Code",
    "Store_Name",
    "Visit_Div_",
    "Pack_Regular",
    "Pack_NPL",
    "Google_Maps",
    "Fake_Indication",
];

// ---------------------------------------------------------------------------
// Logical columns
// ---------------------------------------------------------------------------

/// A logical column resolved through an ordered alias list.
pub trait LogicalColumn: Copy + Ord + std::fmt::Debug + Send + Sync + 'static {
    /// Every logical column of this family, in resolution order.
    const ALL: &'static [Self];

    /// Accepted physical names, most preferred first.
    fn aliases(self) -> &'static [&'static str];
}

/// Logical columns of the sales-visit fact table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Division,
    SalesOffice,
    Warehouse,
    Supervisor,
    Region,
    SalesDate,
    TravelTime,
    Distance,
    Radius,
    VisitTime,
    CustomerCode,
    PackRegular,
    PackNpl,
    FakeIndication,
}

impl Dimension {
    pub fn of_facet(facet: Facet) -> Self {
        match facet {
            Facet::Division => Self::Division,
            Facet::SalesOffice => Self::SalesOffice,
            Facet::Warehouse => Self::Warehouse,
            Facet::Supervisor => Self::Supervisor,
            Facet::Region => Self::Region,
        }
    }

    /// Free-text measures that get stripped and coerced to numbers on fetch.
    pub const NUMERIC_TEXT: [Dimension; 5] = [
        Dimension::Distance,
        Dimension::Radius,
        Dimension::PackRegular,
        Dimension::PackNpl,
        Dimension::FakeIndication,
    ];
}

impl LogicalColumn for Dimension {
    const ALL: &'static [Self] = &[
        Self::Division,
        Self::SalesOffice,
        Self::Warehouse,
        Self::Supervisor,
        Self::Region,
        Self::SalesDate,
        Self::TravelTime,
        Self::Distance,
        Self::Radius,
        Self::VisitTime,
        Self::CustomerCode,
        Self::PackRegular,
        Self::PackNpl,
        Self::FakeIndication,
    ];

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Division => &["Division", "Divisi"],
            Self::SalesOffice => &[
                "Sales_Office_Name",
                "Sales_Office",
                "AMO",
                "AMO_Name",
                "SalesOffice",
                "Sales_OfficeName",
            ],
            Self::Warehouse => &["WH_Name", "Warehouse", "Warehouse_Name", "WH"],
            Self::Supervisor => &[
                "SPV_Employee_Name",
                "SPV_Name",
                "Supervisor",
                "Supervisor_Name",
            ],
            Self::Region => &["Region", "Region_Code", "Area", "Area_Name"],
            Self::SalesDate => &["Sales_Date", "Visit_Date", "Trans_Date", "Date"],
            Self::TravelTime => &[
                "Travel_Transaction_Time_HHMMSS",
                "Travel_Time_HHMMSS",
                "Travel_Transaction_Time",
                "TravelTime",
                "Travel_Time",
                "TransTime",
                "Travel_Trans_HHMMSS",
                "TT_HHMMSS",
            ],
            Self::Distance => &[
                "Distance_Outlet_m",
                "Distance_m",
                "Distance",
                "Outlet_Distance_m",
            ],
            Self::Radius => &["Radius_MNT_m", "Radius_m", "Radius"],
            Self::VisitTime => &["Visit_Time", "VisitTime", "Visit_DateTime"],
            Self::CustomerCode => &["Customer_Code", "CustomerCode", "Cust_Code", "Outlet_Code"],
            Self::PackRegular => &["Pack_Regular", "Regular_Pack", "PackRegular"],
            Self::PackNpl => &["Pack_NPL", "NPL_Pack", "PackNPL"],
            Self::FakeIndication => &["Fake_Indication", "FakeIndication", "Fake_Ind"],
        }
    }
}

/// Logical columns of the funnel totals table (`cmec`).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelColumn {
    SalesDate,
    Division,
    SalesOffice,
    Region,
    CustomerCode,
    TargetCall,
    CallMade,
    EffectiveCall,
    SalesQty,
}

impl LogicalColumn for FunnelColumn {
    const ALL: &'static [Self] = &[
        Self::SalesDate,
        Self::Division,
        Self::SalesOffice,
        Self::Region,
        Self::CustomerCode,
        Self::TargetCall,
        Self::CallMade,
        Self::EffectiveCall,
        Self::SalesQty,
    ];

    fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::SalesDate => &["Sales_Date", "Visit_Date", "Trans_Date", "Date"],
            Self::Division => Dimension::Division.aliases(),
            Self::SalesOffice => Dimension::SalesOffice.aliases(),
            Self::Region => Dimension::Region.aliases(),
            Self::CustomerCode => Dimension::CustomerCode.aliases(),
            Self::TargetCall => &["Target_Call", "TargetCall", "Target_Calls"],
            Self::CallMade => &["CM", "Call_Made", "CallMade"],
            Self::EffectiveCall => &["EC", "EC_Total", "Effective_Call", "EffectiveCall"],
            Self::SalesQty => &["Sales_Qty", "SalesQty", "Sales_Quantity", "Qty"],
        }
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Where a logical column landed in the live table.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "column", rename_all = "snake_case")]
pub enum ColumnBinding {
    Available(String),
    Unavailable,
}

impl ColumnBinding {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Available(name) => Some(name),
            Self::Unavailable => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available(_))
    }
}

/// A resolved logical → physical column map for one table snapshot.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedColumns<K: LogicalColumn> {
    pub table: TableName,
    bindings: BTreeMap<K, ColumnBinding>,
    /// Physical columns the map was resolved from.
    pub columns: Vec<String>,
    /// True when `columns` is the hard-coded fallback, not the live catalog.
    pub degraded: bool,
}

/// Fact-table schema.
pub type SchemaMap = ResolvedColumns<Dimension>;

/// Funnel-totals schema.
pub type FunnelSchema = ResolvedColumns<FunnelColumn>;

impl<K: LogicalColumn> ResolvedColumns<K> {
    /// Resolve every logical column against `columns`.
    pub fn from_columns(table: TableName, columns: Vec<String>, degraded: bool) -> Self {
        let bindings = K::ALL
            .iter()
            .map(|key| {
                let binding = match pick_column(key.aliases(), &columns) {
                    Some(real) => ColumnBinding::Available(real),
                    None => ColumnBinding::Unavailable,
                };
                (*key, binding)
            })
            .collect();
        Self {
            table,
            bindings,
            columns,
            degraded,
        }
    }

    pub fn binding(&self, key: K) -> &ColumnBinding {
        static UNAVAILABLE: ColumnBinding = ColumnBinding::Unavailable;
        self.bindings.get(&key).unwrap_or(&UNAVAILABLE)
    }

    /// Physical column for `key`, if it resolved.
    pub fn column(&self, key: K) -> Option<&str> {
        self.binding(key).name()
    }

    pub fn is_available(&self, key: K) -> bool {
        self.binding(key).is_available()
    }

    /// Exact-name membership in the raw column list.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn unresolved(&self) -> Vec<K> {
        self.bindings
            .iter()
            .filter(|(_, b)| !b.is_available())
            .map(|(k, _)| *k)
            .collect()
    }
}

/// Pick the first alias present in `available`, matching case-insensitively
/// and returning the column's real spelling.
pub fn pick_column(candidates: &[&str], available: &[String]) -> Option<String> {
    if available.is_empty() {
        return None;
    }
    let by_lower: FxHashMap<String, &String> = available
        .iter()
        .map(|c| (c.to_lowercase(), c))
        .collect();
    candidates
        .iter()
        .filter(|c| !c.is_empty())
        .find_map(|c| by_lower.get(&c.to_lowercase()).map(|real| (*real).clone()))
}

/// Read the column catalog for `table`.
pub fn list_columns<S: FactStore + ?Sized>(
    store: &S,
    table: &TableName,
    ctx: &RequestContext,
) -> AnalyticsResult<Vec<String>> {
    let dialect = store.dialect();
    let (sql, params) = dialect.catalog_query(table);
    let raw = store
        .query(&sql, &params, ctx)
        .map_err(|e| AnalyticsError::SchemaUnavailable {
            table: table.to_string(),
            message: e.to_string(),
        })?;
    let columns: Vec<String> = raw
        .rows
        .iter()
        .filter_map(|row| row.first().and_then(Cell::as_text))
        .filter(|name| !name.is_empty())
        .collect();
    // Catalogs list nothing for a table that does not exist.
    if columns.is_empty() {
        return Err(AnalyticsError::SchemaUnavailable {
            table: table.to_string(),
            message: "table not found or has no columns".to_string(),
        });
    }
    Ok(columns)
}

/// Resolve the fact-table schema from the live catalog.
pub fn resolve_schema<S: FactStore + ?Sized>(
    store: &S,
    table: &TableName,
    ctx: &RequestContext,
) -> AnalyticsResult<SchemaMap> {
    let columns = list_columns(store, table, ctx)?;
    Ok(SchemaMap::from_columns(table.clone(), columns, false))
}

/// Degraded fact-table schema used when the catalog is unreachable.
pub fn fallback_schema(table: &TableName) -> SchemaMap {
    let columns = FALLBACK_FACT_COLUMNS.iter().map(|c| c.to_string()).collect();
    SchemaMap::from_columns(table.clone(), columns, true)
}

/// Resolve the funnel-totals schema from the live catalog.
pub fn resolve_funnel_schema<S: FactStore + ?Sized>(
    store: &S,
    table: &TableName,
    ctx: &RequestContext,
) -> AnalyticsResult<FunnelSchema> {
    let columns = list_columns(store, table, ctx)?;
    Ok(FunnelSchema::from_columns(table.clone(), columns, false))
}

/// Degraded funnel schema: nothing resolves, so the funnel totals stay zero.
pub fn fallback_funnel_schema(table: &TableName) -> FunnelSchema {
    FunnelSchema::from_columns(table.clone(), Vec::new(), true)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
