use clap::{Parser, Subcommand, ValueEnum};
use dbfsync::catalog::Catalog;
use dbfsync::config::load_or_init;
use dbfsync::value::{cast_row, parse_column_type};
use dbfsync::{adapter, Condition, Engine, Orchestrator, ShutdownSignal, Storage};
use serde::Serialize;
use std::path::PathBuf;
use std::process;

/// dbfsync CLI: keep DBF files and SQLite tables in sync
#[derive(Parser)]
#[command(name = "dbfsync", version, about)]
struct Cli {
    /// Path to config.yaml (default: <config dir>/dbfsync/config.yaml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Create a table (and its file)
    Create {
        /// Source file name or path
        source: String,
        /// Table name (ignored for DBF)
        #[arg(long, default_value = "")]
        table: String,
        /// Column definitions (e.g. --column name="C(30)" or --column id=INTEGER)
        #[arg(long = "column", value_parser = parse_key_value, required = true)]
        columns: Vec<(String, String)>,
    },

    /// Insert one row
    Insert {
        source: String,
        #[arg(long, default_value = "")]
        table: String,
        /// Field values (e.g. --field name="Alice Chen")
        #[arg(long = "field", value_parser = parse_key_value, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Read rows, optionally filtered
    Read {
        source: String,
        #[arg(long, default_value = "")]
        table: String,
        /// Filter (e.g. --condition row_number == 3)
        #[arg(long, num_args = 3, value_names = ["FIELD", "OP", "VALUE"], allow_hyphen_values = true)]
        condition: Option<Vec<String>>,
    },

    /// Update every row matching a condition
    Update {
        source: String,
        #[arg(long, default_value = "")]
        table: String,
        /// Field values to set
        #[arg(long = "field", value_parser = parse_key_value, required = true)]
        fields: Vec<(String, String)>,
        #[arg(long, num_args = 3, value_names = ["FIELD", "OP", "VALUE"], allow_hyphen_values = true, required = true)]
        condition: Vec<String>,
    },

    /// Delete every row matching a condition
    Delete {
        source: String,
        #[arg(long, default_value = "")]
        table: String,
        #[arg(long, num_args = 3, value_names = ["FIELD", "OP", "VALUE"], allow_hyphen_values = true, required = true)]
        condition: Vec<String>,
    },

    /// Drop a table; with no table name, remove the whole file
    Drop {
        source: String,
        #[arg(long, default_value = "")]
        table: String,
        /// Confirm the drop
        #[arg(long)]
        yes: bool,
    },

    /// Run one reconciliation pass with a fixed origin family
    Migrate {
        /// Engine family treated as origin
        #[arg(long, value_parser = parse_engine)]
        priority: Engine,
        /// Show planned operations without applying them
        #[arg(long)]
        dry_run: bool,
    },

    /// Migrate once with DBF priority, then follow file changes until interrupted
    Sync,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_engine(s: &str) -> Result<Engine, String> {
    Engine::ALL
        .into_iter()
        .find(|e| e.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("Unknown engine '{s}' (expected DBF or SQL)"))
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = match cli.config {
        Some(path) => path,
        None => dirs::config_dir()
            .ok_or("Cannot determine the user config directory; pass --config")?
            .join("dbfsync")
            .join("config.yaml"),
    };
    let config = load_or_init(&config_path)?;
    let catalog = Catalog::from_config(&config)?;
    let format = cli.format;

    match cli.command {
        Command::Create {
            source,
            table,
            columns,
        } => {
            let target = Target::resolve(&catalog, &source)?;
            let defs = columns
                .iter()
                .map(|(name, tag)| parse_column_type(target.engine, name, tag))
                .collect::<Result<Vec<_>, _>>()?;
            target.storage().create_table(&target.path, &table, &defs)?;
            print_output(&serde_json::json!({ "ok": true, "created": target.label(&table) }), &format)?;
        }

        Command::Insert {
            source,
            table,
            fields,
        } => {
            let target = Target::resolve(&catalog, &source)?;
            let columns = target.storage().columns(&target.path, &table)?;
            let row = cast_row(&columns, &fields)?;
            target.storage().insert_row(&target.path, &table, &row)?;
            print_output(&serde_json::json!({ "ok": true, "inserted": row }), &format)?;
        }

        Command::Read {
            source,
            table,
            condition,
        } => {
            let target = Target::resolve(&catalog, &source)?;
            let condition = condition.as_deref().map(parse_condition).transpose()?;
            let rows = target
                .storage()
                .read_rows(&target.path, &table, condition.as_ref())?;
            print_output(&rows, &format)?;
        }

        Command::Update {
            source,
            table,
            fields,
            condition,
        } => {
            let target = Target::resolve(&catalog, &source)?;
            let condition = parse_condition(&condition)?;
            let columns = target.storage().columns(&target.path, &table)?;
            let row = cast_row(&columns, &fields)?;
            let updated = target
                .storage()
                .update_rows(&target.path, &table, &row, &condition)?;
            print_output(&serde_json::json!({ "ok": true, "updated": updated }), &format)?;
        }

        Command::Delete {
            source,
            table,
            condition,
        } => {
            let target = Target::resolve(&catalog, &source)?;
            let condition = parse_condition(&condition)?;
            let deleted = target
                .storage()
                .delete_rows(&target.path, &table, &condition)?;
            print_output(&serde_json::json!({ "ok": true, "deleted": deleted }), &format)?;
        }

        Command::Drop { source, table, yes } => {
            let target = Target::resolve(&catalog, &source)?;
            if !yes {
                return Err(format!("Refusing to drop {} without --yes", target.label(&table)).into());
            }
            target.storage().drop_table(&target.path, &table)?;
            print_output(&serde_json::json!({ "ok": true, "dropped": target.label(&table) }), &format)?;
        }

        Command::Migrate { priority, dry_run } => {
            let orchestrator = Orchestrator::new(catalog);
            let report = orchestrator.migrate_once(priority, dry_run)?;
            if dry_run {
                for pair in &report.pairs {
                    for op in pair.operations.operations() {
                        log::info!("{} -> {}: {}", pair.origin, pair.destiny, op.describe());
                    }
                }
            }
            print_output(
                &serde_json::json!({
                    "priority": priority,
                    "dry_run": dry_run,
                    "operations": report.operation_count(),
                    "failures": report.failure_count(),
                    "rejected": report.rejected_count(),
                    "pairs": &report.pairs,
                    "skipped": &report.skipped,
                }),
                &format,
            )?;
        }

        Command::Sync => {
            let orchestrator = Orchestrator::new(catalog);
            let shutdown = ShutdownSignal::new();
            let loop_signal = shutdown.clone();
            let mut task = tokio::task::spawn_blocking(move || orchestrator.sync(&loop_signal));

            let outcome = tokio::select! {
                res = &mut task => res?,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupt received, stopping after the current pass");
                    shutdown.trigger();
                    task.await?
                }
            }?;
            print_output(&serde_json::json!({ "status": outcome }), &format)?;
        }
    }

    Ok(())
}

/// A source resolved to its engine and on-disk path.
struct Target {
    engine: Engine,
    path: PathBuf,
}

impl Target {
    fn resolve(catalog: &Catalog, source: &str) -> dbfsync::Result<Self> {
        let engine = catalog.engine_for(source)?;
        Ok(Target {
            engine,
            path: catalog.resolve_path(engine, source),
        })
    }

    fn storage(&self) -> &'static dyn Storage {
        adapter(self.engine)
    }

    fn label(&self, table: &str) -> String {
        if table.is_empty() {
            self.path.display().to_string()
        } else {
            format!("{}:{table}", self.path.display())
        }
    }
}

fn parse_condition(parts: &[String]) -> dbfsync::Result<Condition> {
    match parts {
        [field, op, value] => Condition::parse(field, op, value),
        _ => Err(dbfsync::SyncError::Config(
            "--condition takes FIELD OP VALUE".into(),
        )),
    }
}

fn print_output<T: Serialize>(value: &T, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(value)?);
        }
    }
    Ok(())
}
