use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use smart_report::analytics::{
    AnalyticsError, AnalyticsResult, Dialect, EngineOptions, FactStore, ManualClock, NamedParams,
    Operation, RawRows, ReportEngine, RequestContext, SqliteStore,
};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    /// Install process-wide so rayon workers log into the buffer too. Only
    /// one test per binary may call this.
    pub fn install_global(&self) {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("global subscriber unset");
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }

    pub fn unset(key: &str) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::remove_var(key) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

#[allow(dead_code)]
pub fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
}

/// One row of the visit fact table. Numeric-looking columns are stored as
/// text, as in the production table.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct Visit {
    pub division: String,
    pub sales_office: String,
    pub warehouse: String,
    pub supervisor: String,
    pub region: String,
    pub sales_date: NaiveDate,
    pub visit_time: String,
    pub customer_code: String,
    pub pack_regular: String,
    pub pack_npl: String,
    pub travel_time: String,
    pub distance: String,
    pub radius: String,
    pub fake_indication: String,
}

#[allow(dead_code)]
impl Visit {
    pub fn new(division: &str, sales_office: &str, sales_date: NaiveDate) -> Self {
        Self {
            division: division.into(),
            sales_office: sales_office.into(),
            warehouse: "WH-1".into(),
            supervisor: "Sari".into(),
            region: "R1".into(),
            sales_date,
            visit_time: format!("{} 08:00:00", sales_date.format("%Y-%m-%d")),
            customer_code: "100045".into(),
            pack_regular: "2".into(),
            pack_npl: "1".into(),
            travel_time: "00:10:00".into(),
            distance: "100".into(),
            radius: "20".into(),
            fake_indication: "0".into(),
        }
    }

    pub fn at(mut self, time: &str) -> Self {
        self.visit_time = format!("{} {time}", self.sales_date.format("%Y-%m-%d"));
        self
    }

    pub fn org(mut self, warehouse: &str, supervisor: &str, region: &str) -> Self {
        self.warehouse = warehouse.into();
        self.supervisor = supervisor.into();
        self.region = region.into();
        self
    }

    pub fn customer(mut self, code: &str) -> Self {
        self.customer_code = code.into();
        self
    }

    pub fn packs(mut self, regular: &str, npl: &str) -> Self {
        self.pack_regular = regular.into();
        self.pack_npl = npl.into();
        self
    }
}

/// One row of the funnel totals table.
#[derive(Clone, Debug)]
#[allow(dead_code)]
pub struct CmecRow {
    pub sales_date: NaiveDate,
    pub division: String,
    pub sales_office: String,
    pub region: String,
    pub customer_code: String,
    pub target_call: i64,
    pub cm: i64,
    pub ec: i64,
    pub sales_qty: f64,
}

#[allow(dead_code)]
impl CmecRow {
    pub fn new(visit: &Visit, target_call: i64, cm: i64, ec: i64, sales_qty: f64) -> Self {
        Self {
            sales_date: visit.sales_date,
            division: visit.division.clone(),
            sales_office: visit.sales_office.clone(),
            region: visit.region.clone(),
            customer_code: visit.customer_code.clone(),
            target_call,
            cm,
            ec,
            sales_qty,
        }
    }
}

const FACT_DDL: &str = "CREATE TABLE SMI_Final (
    Division TEXT, Sales_Office_Name TEXT, WH_Name TEXT, SPV_Employee_Name TEXT,
    Region TEXT, Sales_Date TEXT, Visit_Time TEXT, Customer_Code TEXT,
    Store_Name TEXT, Pack_Regular TEXT, Pack_NPL TEXT,
    Travel_Transaction_Time_HHMMSS TEXT, Distance_Outlet_m TEXT, Radius_MNT_m TEXT,
    Fake_Indication TEXT)";

const FUNNEL_DDL: &str = "CREATE TABLE cmec (
    Sales_Date TEXT, Division TEXT, Sales_Office_Name TEXT, Region TEXT,
    Customer_Code TEXT, Target_Call INTEGER, CM INTEGER, EC INTEGER, Sales_Qty REAL)";

/// Seed the fact and funnel tables into an open connection.
#[allow(dead_code)]
pub fn seed(conn: &Connection, visits: &[Visit], cmec: &[CmecRow]) {
    conn.execute_batch(&format!("{FACT_DDL}; {FUNNEL_DDL};"))
        .expect("create tables");
    for v in visits {
        conn.execute(
            "INSERT INTO SMI_Final VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                v.division,
                v.sales_office,
                v.warehouse,
                v.supervisor,
                v.region,
                v.sales_date.format("%Y-%m-%d").to_string(),
                v.visit_time,
                v.customer_code,
                format!("Toko {}", v.customer_code),
                v.pack_regular,
                v.pack_npl,
                v.travel_time,
                v.distance,
                v.radius,
                v.fake_indication,
            ],
        )
        .expect("insert visit");
    }
    for c in cmec {
        conn.execute(
            "INSERT INTO cmec VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                c.sales_date.format("%Y-%m-%d").to_string(),
                c.division,
                c.sales_office,
                c.region,
                c.customer_code,
                c.target_call,
                c.cm,
                c.ec,
                c.sales_qty,
            ],
        )
        .expect("insert cmec");
    }
}

/// A seeded SQLite file in a temp directory.
#[allow(dead_code)]
pub struct FixtureDb {
    pub dir: TempDir,
    pub path: PathBuf,
}

#[allow(dead_code)]
impl FixtureDb {
    pub fn new(visits: &[Visit], cmec: &[CmecRow]) -> Self {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("smart.db");
        let conn = Connection::open(&path).expect("open db");
        seed(&conn, visits, cmec);
        drop(conn);
        Self { dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> SqliteStore {
        SqliteStore::open(&self.path, 2).expect("open store")
    }
}

/// In-memory store seeded with `visits` and `cmec`.
#[allow(dead_code)]
pub fn memory_store(visits: &[Visit], cmec: &[CmecRow]) -> SqliteStore {
    let conn = Connection::open_in_memory().expect("in-memory db");
    seed(&conn, visits, cmec);
    SqliteStore::from_connection(conn)
}

#[allow(dead_code)]
pub fn engine_over<S: FactStore>(store: S, today: NaiveDate) -> ReportEngine<S> {
    ReportEngine::new(
        Arc::new(store),
        EngineOptions::default(),
        Arc::new(ManualClock::new(today)),
    )
}

/// Wraps a store and fails every query whose SQL contains one of the
/// configured fragments. Records every statement it sees.
#[allow(dead_code)]
pub struct FailingStore<S> {
    inner: S,
    fail_on: Mutex<Vec<String>>,
    seen: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl<S: FactStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_on: Mutex::new(Vec::new()),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_on(self, fragment: &str) -> Self {
        self.fail_on.lock().push(fragment.to_string());
        self
    }

    pub fn heal(&self) {
        self.fail_on.lock().clear();
    }

    pub fn statements(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl<S: FactStore> FactStore for FailingStore<S> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn query(
        &self,
        sql: &str,
        params: &NamedParams,
        ctx: &RequestContext,
    ) -> AnalyticsResult<RawRows> {
        self.seen.lock().push(sql.to_string());
        if let Some(fragment) = self.fail_on.lock().iter().find(|f| sql.contains(f.as_str())) {
            return Err(AnalyticsError::query(
                Operation::RowCount,
                format!("injected failure on `{fragment}`"),
            ));
        }
        self.inner.query(sql, params, ctx)
    }

    fn interrupt(&self, cancel: &smart_report::analytics::CancelToken) {
        self.inner.interrupt(cancel)
    }
}
