//! Read-only query execution.
//!
//! [`FactStore`] is the seam between the engine and a database connection.
//! The engine only renders SQL text plus named parameters; a store executes
//! them and hands back untyped rows. [`SqliteStore`] is the rusqlite-backed
//! implementation with a small pool of read-only connections.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, InterruptHandle, OpenFlags, ToSql};
use tracing::debug;

use super::dialect::Dialect;
use super::types::*;

/// Rows as returned by a store, before any projection to [`RowSet`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl RawRows {
    /// First cell of the first row, if any.
    pub fn scalar(&self) -> Option<&Cell> {
        self.rows.first().and_then(|r| r.first())
    }

    /// Cell `column` of the first row.
    pub fn first_value(&self, column: &str) -> Option<&Cell> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.first().and_then(|r| r.get(idx))
    }

    pub fn into_row_set(self) -> RowSet {
        let rows = self
            .rows
            .into_iter()
            .map(|cells| ReportRow {
                cells: self.columns.iter().cloned().zip(cells).collect(),
            })
            .collect();
        RowSet {
            columns: self.columns,
            rows,
        }
    }
}

/// Something that can run a read-only parameterized query.
pub trait FactStore: Send + Sync {
    fn dialect(&self) -> Dialect;

    /// Run `sql` with `params` bound by name (`:name` placeholders) on
    /// behalf of the request `ctx`.
    fn query(&self, sql: &str, params: &NamedParams, ctx: &RequestContext)
    -> AnalyticsResult<RawRows>;

    /// Abort statements running for the request that owns `cancel`. Other
    /// requests' statements keep running.
    fn interrupt(&self, _cancel: &CancelToken) {}
}

impl<T: FactStore + ?Sized> FactStore for std::sync::Arc<T> {
    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn query(
        &self,
        sql: &str,
        params: &NamedParams,
        ctx: &RequestContext,
    ) -> AnalyticsResult<RawRows> {
        (**self).query(sql, params, ctx)
    }

    fn interrupt(&self, cancel: &CancelToken) {
        (**self).interrupt(cancel)
    }
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            SqlValue::Text(s) => Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            SqlValue::Int(i) => Ok(ToSqlOutput::from(*i)),
            SqlValue::Date(d) => Ok(ToSqlOutput::from(d.format("%Y-%m-%d").to_string())),
        }
    }
}

fn cell_from_value(value: ValueRef<'_>) -> Cell {
    match value {
        ValueRef::Null => Cell::Null,
        ValueRef::Integer(i) => Cell::Int(i),
        ValueRef::Real(r) => Cell::Real(r),
        ValueRef::Text(t) => Cell::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Cell::Text(String::from_utf8_lossy(b).into_owned()),
    }
}

/// How long a waiting query sleeps before re-checking its cancel flag.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// A connection checked out by one request.
struct Lease {
    id: u64,
    cancel: CancelToken,
    interrupt: InterruptHandle,
}

#[derive(Default)]
struct Pool {
    idle: Vec<Connection>,
    /// Connections in existence, idle or leased.
    open: usize,
    leased: Vec<Lease>,
    next_id: u64,
}

impl Pool {
    fn lease(&mut self, conn: &Connection, cancel: &CancelToken) -> u64 {
        self.next_id += 1;
        self.leased.push(Lease {
            id: self.next_id,
            cancel: cancel.clone(),
            interrupt: conn.get_interrupt_handle(),
        });
        self.next_id
    }
}

/// rusqlite-backed store.
///
/// File-backed stores open read-only connections lazily, never more than
/// `pool_size` at once; further queries wait for one to come back. Stores
/// built from an existing connection (in-memory fixtures) serialize every
/// query through that one connection.
pub struct SqliteStore {
    path: Option<PathBuf>,
    pool: Mutex<Pool>,
    returned: Condvar,
    pool_size: usize,
}

impl SqliteStore {
    /// Open a store over a database file.
    pub fn open(path: impl AsRef<Path>, pool_size: usize) -> AnalyticsResult<Self> {
        let path = path.as_ref().to_path_buf();
        // Fail early on an unreadable file instead of on the first facet.
        let conn = Self::connect(&path)?;
        Ok(Self {
            path: Some(path),
            pool: Mutex::new(Pool {
                idle: vec![conn],
                open: 1,
                ..Pool::default()
            }),
            returned: Condvar::new(),
            pool_size: pool_size.max(1),
        })
    }

    /// Wrap an already-open connection (used for in-memory databases).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            path: None,
            pool: Mutex::new(Pool {
                idle: vec![conn],
                open: 1,
                ..Pool::default()
            }),
            returned: Condvar::new(),
            pool_size: 1,
        }
    }

    /// Connections currently open, idle or in use.
    pub fn open_connections(&self) -> usize {
        self.pool.lock().open
    }

    /// Connections currently checked out by a query.
    pub fn leased_connections(&self) -> usize {
        self.pool.lock().leased.len()
    }

    fn connect(path: &Path) -> AnalyticsResult<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| AnalyticsError::query(Operation::Schema, format!("open {}: {e}", path.display())))
    }

    /// Check out a connection for `cancel`'s request, waiting while all
    /// `pool_size` connections are busy. Returns the lease id for `release`.
    fn acquire(&self, cancel: &CancelToken) -> AnalyticsResult<(Connection, u64)> {
        let mut pool = self.pool.lock();
        loop {
            cancel.check()?;
            if let Some(conn) = pool.idle.pop() {
                let id = pool.lease(&conn, cancel);
                return Ok((conn, id));
            }
            if let Some(path) = &self.path
                && pool.open < self.pool_size
            {
                pool.open += 1;
                drop(pool);
                let conn = match Self::connect(path) {
                    Ok(conn) => conn,
                    Err(err) => {
                        self.pool.lock().open -= 1;
                        self.returned.notify_one();
                        return Err(err);
                    }
                };
                debug!(pool_size = self.pool_size, "sqlite connection opened");
                pool = self.pool.lock();
                let id = pool.lease(&conn, cancel);
                return Ok((conn, id));
            }
            self.returned.wait_for(&mut pool, CANCEL_POLL);
        }
    }

    fn release(&self, conn: Connection, id: u64) {
        let mut pool = self.pool.lock();
        pool.leased.retain(|lease| lease.id != id);
        pool.idle.push(conn);
        drop(pool);
        self.returned.notify_one();
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    params: &NamedParams,
    read_mode: ReadMode,
) -> rusqlite::Result<RawRows> {
    // Only meaningful for shared-cache connections; harmless elsewhere.
    conn.pragma_update(None, "read_uncommitted", read_mode.is_dirty())?;

    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let names: Vec<String> = params.iter().map(|(n, _)| format!(":{n}")).collect();
    let bound: Vec<(&str, &dyn ToSql)> = names
        .iter()
        .zip(params.iter())
        .map(|(n, (_, v))| (n.as_str(), v as &dyn ToSql))
        .collect();

    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query(bound.as_slice())?;
    while let Some(row) = cursor.next()? {
        let mut cells = Vec::with_capacity(width);
        for idx in 0..width {
            cells.push(cell_from_value(row.get_ref(idx)?));
        }
        rows.push(cells);
    }
    Ok(RawRows { columns, rows })
}

impl FactStore for SqliteStore {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn query(
        &self,
        sql: &str,
        params: &NamedParams,
        ctx: &RequestContext,
    ) -> AnalyticsResult<RawRows> {
        let (conn, lease) = self.acquire(&ctx.cancel)?;
        debug!(params = params.len(), dirty = ctx.read_mode.is_dirty(), "sqlite query");
        let result = run_query(&conn, sql, params, ctx.read_mode);
        self.release(conn, lease);
        // Callers relabel with the operation they were running.
        result.map_err(|e| AnalyticsError::query(Operation::RowCount, e))
    }

    fn interrupt(&self, cancel: &CancelToken) {
        let pool = self.pool.lock();
        let mut hit = 0;
        for lease in pool.leased.iter().filter(|l| l.cancel.same_request(cancel)) {
            lease.interrupt.interrupt();
            hit += 1;
        }
        debug!(connections = hit, "sqlite statements interrupted");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT, qty INTEGER, price REAL, note TEXT);
             INSERT INTO t VALUES ('a', 1, 1.5, NULL);
             INSERT INTO t VALUES ('b', 2, 2.5, 'x');",
        )
        .unwrap();
        SqliteStore::from_connection(conn)
    }

    #[test]
    fn query_binds_named_params_and_types_cells() {
        let store = store();
        let rows = store
            .query(
                "SELECT name, qty, price, note FROM t WHERE name = :name",
                &vec![("name".into(), SqlValue::Text("a".into()))],
                &RequestContext::default(),
            )
            .unwrap();
        assert_eq!(rows.columns, vec!["name", "qty", "price", "note"]);
        assert_eq!(
            rows.rows,
            vec![vec![
                Cell::Text("a".into()),
                Cell::Int(1),
                Cell::Real(1.5),
                Cell::Null
            ]]
        );
    }

    #[test]
    fn bound_values_are_not_interpreted_as_sql() {
        let store = store();
        let rows = store
            .query(
                "SELECT COUNT(*) FROM t WHERE name = :name",
                &vec![("name".into(), SqlValue::Text("a' OR '1'='1".into()))],
                &RequestContext::default(),
            )
            .unwrap();
        assert_eq!(rows.scalar(), Some(&Cell::Int(0)));
    }

    #[test]
    fn bad_sql_is_a_query_failure() {
        let store = store();
        let err = store
            .query("SELECT nope FROM missing", &Vec::new(), &RequestContext::default())
            .unwrap_err();
        assert!(matches!(err, AnalyticsError::QueryFailed { .. }));
        // The connection is returned to the pool even after an error.
        assert!(
            store
                .query("SELECT 1", &Vec::new(), &RequestContext::new(ReadMode::Uncommitted))
                .is_ok()
        );
    }

    #[test]
    fn date_params_bind_as_iso_text() {
        let store = store();
        let day = chrono::NaiveDate::from_ymd_opt(2024, 1, 10).unwrap();
        let rows = store
            .query(
                "SELECT :d",
                &vec![("d".into(), SqlValue::Date(day))],
                &RequestContext::default(),
            )
            .unwrap();
        assert_eq!(rows.scalar(), Some(&Cell::Text("2024-01-10".into())));
    }

    #[test]
    fn raw_rows_project_to_row_set() {
        let raw = RawRows {
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![Cell::Int(1), Cell::Text("x".into())]],
        };
        assert_eq!(raw.first_value("b"), Some(&Cell::Text("x".into())));
        let set = raw.into_row_set();
        assert_eq!(set.len(), 1);
        assert_eq!(set.rows[0].get("a"), &Cell::Int(1));
        assert_eq!(set.rows[0].get("missing"), &Cell::Null);
    }

    /// Never finishes on its own.
    const ENDLESS: &str =
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT MAX(x) FROM c";

    fn file_db(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("facts.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (name TEXT);
             INSERT INTO t VALUES ('a');
             INSERT INTO t VALUES ('b');",
        )
        .unwrap();
        path
    }

    /// Interrupt `ctx`'s statements until `handle`'s query returns.
    fn stop(
        store: &SqliteStore,
        ctx: &RequestContext,
        handle: &std::thread::ScopedJoinHandle<'_, AnalyticsResult<RawRows>>,
    ) {
        while !handle.is_finished() {
            store.interrupt(&ctx.cancel);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn pool_never_exceeds_pool_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(file_db(&dir), 2).unwrap();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let rows = store
                            .query("SELECT COUNT(*) FROM t", &Vec::new(), &RequestContext::default())
                            .unwrap();
                        assert_eq!(rows.scalar(), Some(&Cell::Int(2)));
                    }
                });
            }
        });
        assert!(store.open_connections() <= 2);
        assert_eq!(store.leased_connections(), 0);
    }

    #[test]
    fn interrupt_only_stops_the_cancelled_request() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::open(file_db(&dir), 2).unwrap();
        let abandoned = RequestContext::default();
        let live = RequestContext::default();
        std::thread::scope(|scope| {
            let a = scope.spawn(|| store.query(ENDLESS, &Vec::new(), &abandoned));
            let b = scope.spawn(|| store.query(ENDLESS, &Vec::new(), &live));
            while store.leased_connections() < 2 {
                std::thread::yield_now();
            }

            stop(&store, &abandoned, &a);
            assert!(!b.is_finished());
            let err = a.join().unwrap().unwrap_err();
            assert!(err.to_string().contains("interrupt"), "{err}");

            stop(&store, &live, &b);
            assert!(b.join().unwrap().is_err());
        });
        assert_eq!(store.leased_connections(), 0);
        assert_eq!(store.open_connections(), 2);
    }

    #[test]
    fn cancelled_request_stops_waiting_for_a_connection() {
        let store = store();
        let busy = RequestContext::default();
        let waiting = RequestContext::default();
        std::thread::scope(|scope| {
            let running = scope.spawn(|| store.query(ENDLESS, &Vec::new(), &busy));
            while store.leased_connections() < 1 {
                std::thread::yield_now();
            }
            let waiter = scope.spawn(|| store.query("SELECT 1", &Vec::new(), &waiting));
            std::thread::sleep(Duration::from_millis(100));
            assert!(!waiter.is_finished());

            waiting.cancel.cancel();
            assert!(matches!(
                waiter.join().unwrap(),
                Err(AnalyticsError::Cancelled)
            ));
            stop(&store, &busy, &running);
            assert!(running.join().unwrap().is_err());
        });
        assert!(store.query("SELECT 1", &Vec::new(), &RequestContext::default()).is_ok());
    }
}
