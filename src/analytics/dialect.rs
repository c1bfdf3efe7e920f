//! Dialect-dependent SQL fragments.
//!
//! Everything that differs between the production SQL Server target and the
//! embedded SQLite target is rendered here: identifier quoting, the dirty-read
//! hint, pagination, the column catalog and the tolerant conversions used by
//! the aggregate queries. Identifiers only ever come from configuration or a
//! resolved schema, never from filter values.

use serde::{Serialize, Serializer};

use super::types::{NamedParams, ReadMode, SqlValue};

/// Name of the bind parameter carrying the preview row cap.
pub const CAP_PARAM: &str = "cap";

/// A validated `[schema.]table` identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    /// Parse `name` or `schema.name`. Only ASCII letters, digits and `_` are
    /// accepted in each part.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let first = parts.next()?;
        let second = parts.next();
        if parts.next().is_some() {
            return None;
        }
        let valid = |s: &str| {
            !s.is_empty()
                && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !s.starts_with(|c: char| c.is_ascii_digit())
        };
        match second {
            None if valid(first) => Some(Self {
                schema: None,
                name: first.to_string(),
            }),
            Some(name) if valid(first) && valid(name) => Some(Self {
                schema: Some(first.to_string()),
                name: name.to_string(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Serialize for TableName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// SQL dialect of the backing store.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Sqlite,
    #[serde(alias = "mssql")]
    SqlServer,
}

impl Dialect {
    /// Quote a single identifier.
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::Sqlite => format!("\"{}\"", ident.replace('"', "\"\"")),
            Self::SqlServer => format!("[{}]", ident.replace(']', "]]")),
        }
    }

    /// `FROM` target including the dirty-read hint when requested.
    pub fn table_ref(self, table: &TableName, read_mode: ReadMode) -> String {
        let quoted = match &table.schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_ident(schema),
                self.quote_ident(&table.name)
            ),
            None => self.quote_ident(&table.name),
        };
        match (self, read_mode) {
            (Self::SqlServer, ReadMode::Uncommitted) => format!("{quoted} WITH (NOLOCK)"),
            _ => quoted,
        }
    }

    /// Query returning one column name per row, in table order.
    pub fn catalog_query(self, table: &TableName) -> (String, NamedParams) {
        match self {
            Self::Sqlite => {
                let mut params = vec![("table".to_string(), SqlValue::Text(table.name.clone()))];
                let sql = match &table.schema {
                    Some(schema) => {
                        params.push(("schema".to_string(), SqlValue::Text(schema.clone())));
                        "SELECT name FROM pragma_table_info(:table, :schema) ORDER BY cid"
                    }
                    None => "SELECT name FROM pragma_table_info(:table) ORDER BY cid",
                };
                (sql.to_string(), params)
            }
            Self::SqlServer => (
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = :schema AND TABLE_NAME = :table \
                 ORDER BY ORDINAL_POSITION"
                    .to_string(),
                vec![
                    (
                        "schema".to_string(),
                        SqlValue::Text(table.schema.clone().unwrap_or_else(|| "dbo".into())),
                    ),
                    ("table".to_string(), SqlValue::Text(table.name.clone())),
                ],
            ),
        }
    }

    /// Skip-0 / take-`:cap` pagination, newest first by `order_col`.
    pub fn paginate(self, order_col: Option<&str>) -> String {
        match (self, order_col) {
            (Self::Sqlite, Some(col)) => format!(
                " ORDER BY {} DESC LIMIT :{CAP_PARAM} OFFSET 0",
                self.quote_ident(col)
            ),
            (Self::Sqlite, None) => format!(" LIMIT :{CAP_PARAM} OFFSET 0"),
            (Self::SqlServer, Some(col)) => format!(
                " ORDER BY {} DESC OFFSET 0 ROWS FETCH NEXT :{CAP_PARAM} ROWS ONLY",
                self.quote_ident(col)
            ),
            (Self::SqlServer, None) => {
                format!(" ORDER BY (SELECT NULL) OFFSET 0 ROWS FETCH NEXT :{CAP_PARAM} ROWS ONLY")
            }
        }
    }

    /// Numeric view of a possibly free-text column; NULL when it does not
    /// convert as a whole.
    pub fn try_number(self, expr: &str) -> String {
        match self {
            Self::Sqlite => format!(
                "(CASE WHEN typeof({expr}) IN ('integer', 'real') THEN {expr} \
                 WHEN trim({expr}) GLOB '*[0-9]*' AND trim({expr}) NOT GLOB '*[^0-9.+-]*' \
                 THEN CAST(trim({expr}) AS REAL) END)"
            ),
            Self::SqlServer => format!("TRY_CONVERT(float, {expr})"),
        }
    }

    /// Calendar-date truncation.
    pub fn date_of(self, expr: &str) -> String {
        match self {
            Self::Sqlite => format!("date({expr})"),
            Self::SqlServer => format!("CAST({expr} AS DATE)"),
        }
    }

    /// Seconds since midnight of a TIME-like value; NULL when unparseable.
    pub fn time_to_seconds(self, expr: &str) -> String {
        match self {
            Self::Sqlite => format!(
                "(CASE WHEN typeof({expr}) = 'text' AND {expr} LIKE '%:%' \
                 THEN CAST(strftime('%s', '1970-01-01 ' || time({expr})) AS INTEGER) END)"
            ),
            Self::SqlServer => format!("DATEDIFF(SECOND, 0, TRY_CONVERT(time(0), {expr}))"),
        }
    }

    /// Boolean test: the value's text form starts with `9`.
    pub fn leading_nine(self, expr: &str) -> String {
        match self {
            Self::Sqlite => format!("substr(CAST({expr} AS TEXT), 1, 1) = '9'"),
            Self::SqlServer => format!("LEFT(CAST({expr} AS varchar(64)), 1) = '9'"),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite => write!(f, "sqlite"),
            Self::SqlServer => write!(f, "sqlserver"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
