pub mod analytics;
pub mod config;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use crate::analytics::{
    DateRange, Dialect, Facet, FacetValue, FilterSelection, QueryFailure, ReadMode, ReportEngine,
    RequestContext, SqliteStore, SystemClock,
};
use crate::config::{ConfigError, EngineConfig};

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "smart_report=info";

#[derive(Parser, Debug, Clone)]
#[command(
    name = "smart",
    version,
    about = "Cascading filters, sales funnel and route summary over SMART visit data"
)]
pub struct Cli {
    /// Path to engine.toml (defaults to $XDG_CONFIG_HOME/smart/engine.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file; overrides `database` from the config
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Read uncommitted data
    #[arg(long, global = true)]
    pub dirty_read: bool,

    /// Compact machine-readable output (errors as JSON objects)
    #[arg(long, visible_alias = "robot", global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Print the reconciled filter form: selection, option lists, date bounds
    Facets {
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Build the full report for a selection
    Report {
        #[command(flatten)]
        filters: FilterArgs,

        /// Preview row cap (clamped to the configured ceiling)
        #[arg(long)]
        cap: Option<usize>,
    },
    /// Print preview rows, or every matching row with --all
    Rows {
        #[command(flatten)]
        filters: FilterArgs,

        #[arg(long)]
        all: bool,
    },
    /// Print the resolved fact and funnel column maps
    Schema,
}

/// Filter picks shared by the data subcommands. Omitted facets mean "All";
/// prefix a value with `=` to match a stored value spelled "All".
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    #[arg(long)]
    pub division: Option<String>,

    #[arg(long)]
    pub sales_office: Option<String>,

    #[arg(long)]
    pub warehouse: Option<String>,

    #[arg(long)]
    pub supervisor: Option<String>,

    #[arg(long)]
    pub region: Option<String>,

    /// First day (YYYY-MM-DD); defaults to the earliest matching date
    #[arg(long)]
    pub from: Option<NaiveDate>,

    /// Last day, inclusive (YYYY-MM-DD); defaults to the latest matching date
    #[arg(long)]
    pub to: Option<NaiveDate>,
}

impl FilterArgs {
    /// Held selection before reconciliation. Missing ends stay open so the
    /// clamp against the data bounds fills them in.
    pub fn selection(&self) -> FilterSelection {
        let unbounded = DateRange::unbounded();
        let range = DateRange::new(
            self.from.unwrap_or(unbounded.start),
            self.to.unwrap_or(unbounded.end),
        );
        let mut selection = FilterSelection::all(range);
        for (facet, raw) in [
            (Facet::Division, &self.division),
            (Facet::SalesOffice, &self.sales_office),
            (Facet::Warehouse, &self.warehouse),
            (Facet::Supervisor, &self.supervisor),
            (Facet::Region, &self.region),
        ] {
            if let Some(raw) = raw {
                selection.set(facet, FacetValue::parse(raw));
            }
        }
        selection
    }
}

/// Error surfaced to the binary: exit code plus a machine-readable kind.
#[derive(Debug, Clone, Serialize)]
pub struct CliError {
    pub code: i32,
    pub kind: &'static str,
    pub message: String,
    pub hint: Option<String>,
    pub retryable: bool,
}

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

impl CliError {
    pub fn usage(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            code: 2,
            kind: "usage",
            message: message.into(),
            hint,
            retryable: false,
        }
    }

    fn partial(failures: &[QueryFailure]) -> Self {
        let detail = failures
            .iter()
            .map(|f| f.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            code: 3,
            kind: "partial",
            message: format!("{} query failure(s): {detail}", failures.len()),
            hint: Some("affected sections were left empty; retry once the database recovers".into()),
            retryable: true,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self {
            code: 2,
            kind: "config",
            message: err.to_string(),
            hint: None,
            retryable: false,
        }
    }
}

/// Parse raw process arguments. `--help` / `--version` come back as a
/// code-0 error carrying the rendered text.
pub fn parse_cli<I, T>(args: I) -> CliResult<Cli>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(args).map_err(|err| {
        use clap::error::ErrorKind;
        match err.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => CliError {
                code: 0,
                kind: "help",
                message: err.to_string(),
                hint: None,
                retryable: false,
            },
            _ => CliError::usage(err.to_string(), Some("see `smart --help`".into())),
        }
    })
}

/// Install the stderr subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn load_config(cli: &Cli) -> CliResult<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)?,
        None => EngineConfig::load()?,
    };
    if let Some(db) = &cli.db {
        config.database = Some(db.clone());
    }
    Ok(config)
}

fn open_engine(config: &EngineConfig) -> CliResult<ReportEngine<SqliteStore>> {
    if config.dialect != Dialect::Sqlite {
        return Err(CliError::usage(
            format!("dialect '{}' has no bundled driver", config.dialect),
            Some("the CLI reads SQLite files; set dialect = \"sqlite\"".into()),
        ));
    }
    let path = config.database.as_ref().ok_or_else(|| {
        CliError::usage(
            "no database configured",
            Some("pass --db, set SMART_DATABASE, or add `database` to engine.toml".into()),
        )
    })?;
    let store = SqliteStore::open(path, config.pool_size).map_err(|err| CliError {
        code: 2,
        kind: "database",
        message: err.to_string(),
        hint: Some(format!("check that {} is a readable SQLite file", path.display())),
        retryable: true,
    })?;
    debug!(database = %path.display(), pool_size = config.pool_size, "store opened");
    Ok(ReportEngine::new(
        Arc::new(store),
        config.engine_options()?,
        Arc::new(SystemClock),
    ))
}

fn emit<T: Serialize>(value: &T, compact: bool) -> CliResult {
    let rendered = if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    };
    let text = rendered.map_err(|err| CliError {
        code: 1,
        kind: "serialize",
        message: err.to_string(),
        hint: None,
        retryable: false,
    })?;
    println!("{text}");
    Ok(())
}

fn finish(failures: &[QueryFailure]) -> CliResult {
    if failures.is_empty() {
        Ok(())
    } else {
        Err(CliError::partial(failures))
    }
}

pub fn run(cli: Cli) -> CliResult {
    let config = load_config(&cli)?;
    let engine = open_engine(&config)?;
    let ctx = RequestContext::new(ReadMode::from_dirty_flag(
        cli.dirty_read || config.read_uncommitted,
    ));

    match &cli.command {
        Commands::Facets { filters } => {
            let form = engine.reconcile(&filters.selection(), &ctx);
            emit(&form, cli.json)?;
            finish(&form.failures)
        }
        Commands::Report { filters, cap } => {
            let form = engine.reconcile(&filters.selection(), &ctx);
            let mut report = engine.submit(&form.selection, *cap, &ctx);
            // Form failures precede the submission's own.
            let mut failures = form.failures;
            failures.append(&mut report.failures);
            report.failures = failures;
            if report.no_rows_matched() {
                info!("no rows matched the selection");
            }
            emit(&report, cli.json)?;
            finish(&report.failures)
        }
        Commands::Rows { filters, all } => {
            let form = engine.reconcile(&filters.selection(), &ctx);
            let fetched = if *all {
                engine.fetch_all(&form.selection, &ctx)
            } else {
                engine.fetch_bounded(&form.selection, None, &ctx)
            };
            let mut failures = form.failures;
            let rows = fetched.collect_into(&mut failures);
            emit(
                &serde_json::json!({ "rows": rows.as_ref(), "failures": &failures }),
                cli.json,
            )?;
            finish(&failures)
        }
        Commands::Schema => {
            let mut failures = Vec::new();
            let fact = engine.schema(&ctx).collect_into(&mut failures);
            let funnel = engine.funnel_schema(&ctx).collect_into(&mut failures);
            emit(
                &serde_json::json!({
                    "fact": fact.as_ref(),
                    "funnel": funnel.as_ref(),
                    "failures": &failures,
                }),
                cli.json,
            )?;
            finish(&failures)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_flags_build_selection() {
        let cli = parse_cli([
            "smart",
            "report",
            "--division",
            "Retail",
            "--region",
            "All",
            "--from",
            "2024-03-05",
            "--to",
            "2024-03-01",
            "--cap",
            "10",
        ])
        .unwrap();
        let Commands::Report { filters, cap } = cli.command else {
            panic!("expected report");
        };
        assert_eq!(cap, Some(10));
        let sel = filters.selection();
        assert_eq!(sel.division, FacetValue::Value("Retail".into()));
        assert!(sel.region.is_all());
        assert!(sel.warehouse.is_all());
        // reversed ends are swapped
        assert_eq!(sel.date_range.start, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(sel.date_range.end, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
    }

    #[test]
    fn missing_dates_stay_open() {
        let sel = FilterArgs::default().selection();
        assert_eq!(sel.date_range, DateRange::unbounded());
    }

    #[test]
    fn global_flags_follow_subcommand() {
        let cli = parse_cli(["smart", "schema", "--json", "--dirty-read"]).unwrap();
        assert!(cli.json);
        assert!(cli.dirty_read);
        assert!(matches!(cli.command, Commands::Schema));
    }

    #[test]
    fn bad_date_is_usage_error() {
        let err = parse_cli(["smart", "facets", "--from", "03/01/2024"]).unwrap_err();
        assert_eq!(err.code, 2);
        assert_eq!(err.kind, "usage");
    }

    #[test]
    fn help_is_code_zero() {
        let err = parse_cli(["smart", "--help"]).unwrap_err();
        assert_eq!(err.code, 0);
        assert!(err.message.contains("facets"));
    }

    #[test]
    fn partial_error_lists_failures() {
        let failures = vec![QueryFailure {
            operation: analytics::Operation::RowCount,
            message: "row count query failed: boom".into(),
        }];
        let err = CliError::partial(&failures);
        assert_eq!(err.code, 3);
        assert!(err.retryable);
        assert!(err.message.contains("boom"));
    }
}
