use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use forum_import_api::{ImportApi, ImportConfig, RunLimits};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "fimport")]
#[command(about = "Resumable legacy forum importer")]
struct Cli {
    #[arg(long, default_value = "./forum_import.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Steps {
        #[command(subcommand)]
        command: StepsCommand,
    },
    Session {
        #[command(subcommand)]
        command: SessionCommand,
    },
    Run(RunArgs),
    Log {
        #[command(subcommand)]
        command: LogCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
    Digest(DbDigestArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbDigestArgs {
    /// Tables to digest; all import tables when omitted.
    #[arg(long = "table")]
    tables: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum StepsCommand {
    List(StepsListArgs),
}

#[derive(Debug, Args)]
struct StepsListArgs {
    #[arg(long)]
    importer: String,
}

#[derive(Debug, Subcommand)]
enum SessionCommand {
    Start(SessionStartArgs),
    Status,
    Rerun(SessionRerunArgs),
    Reset,
}

#[derive(Debug, Args)]
struct SessionStartArgs {
    #[arg(long)]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct SessionRerunArgs {
    #[arg(long)]
    step: String,
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Wall-clock budget per step invocation. Zero imports one record per invocation.
    #[arg(long)]
    max_time_ms: Option<u64>,

    #[arg(long)]
    max_invocations: Option<u64>,

    /// Overrides every step's default batch size.
    #[arg(long)]
    batch_limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum LogCommand {
    Lookup(LogLookupArgs),
    Stats,
}

#[derive(Debug, Args)]
struct LogLookupArgs {
    #[arg(long = "type")]
    entity_type: String,

    #[arg(long)]
    id: i64,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = ImportApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Steps { command } => run_steps(&command, &api),
        Command::Session { command } => run_session(command, &api),
        Command::Run(args) => run_import(&args, &api),
        Command::Log { command } => run_log(&command, &api),
    }
}

fn run_db(command: DbCommand, api: &ImportApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit_json(serde_json::to_value(api.migrate(args.dry_run)?)?),
        DbCommand::IntegrityCheck => {
            let report = api.integrity_check()?;
            let ok = report.quick_check_ok && report.foreign_key_violations.is_empty();
            let mut value = serde_json::to_value(report)?;
            if let Value::Object(object) = &mut value {
                object.insert("ok".to_string(), Value::Bool(ok));
            }
            emit_json(value)
        }
        DbCommand::Digest(args) => {
            let digests = api.digest(&args.tables)?;
            emit_json(serde_json::json!({ "tables": digests }))
        }
    }
}

fn run_steps(command: &StepsCommand, api: &ImportApi) -> Result<()> {
    match command {
        StepsCommand::List(args) => {
            let steps = api.list_steps(&args.importer)?;
            emit_json(serde_json::json!({ "importer": args.importer, "steps": steps }))
        }
    }
}

fn run_session(command: SessionCommand, api: &ImportApi) -> Result<()> {
    match command {
        SessionCommand::Start(args) => {
            let config = ImportConfig::load(&args.config)?;
            let status = api.start_session(&config)?;
            emit_json(serde_json::json!({ "session": status }))
        }
        SessionCommand::Status => {
            let status = api.status()?;
            emit_json(serde_json::json!({ "session": status }))
        }
        SessionCommand::Rerun(args) => {
            let status = api.rerun(&args.step)?;
            emit_json(serde_json::json!({ "session": status }))
        }
        SessionCommand::Reset => {
            let cleared = api.reset()?;
            emit_json(serde_json::json!({ "cleared": cleared }))
        }
    }
}

fn run_import(args: &RunArgs, api: &ImportApi) -> Result<()> {
    let defaults = RunLimits::default();
    let limits = RunLimits {
        max_time: args.max_time_ms.map_or(defaults.max_time, Duration::from_millis),
        max_invocations: args.max_invocations,
        batch_limit: args.batch_limit,
    };
    let result = api.run(limits)?;
    emit_json(serde_json::to_value(result)?)
}

fn run_log(command: &LogCommand, api: &ImportApi) -> Result<()> {
    match command {
        LogCommand::Lookup(args) => {
            let new_id = api.lookup(&args.entity_type, args.id)?;
            emit_json(serde_json::json!({
                "entity_type": args.entity_type,
                "legacy_id": args.id,
                "new_id": new_id,
                "found": new_id.is_some()
            }))
        }
        LogCommand::Stats => {
            let stats = api.log_stats()?;
            let total: u64 = stats.iter().map(|stat| stat.entries).sum();
            emit_json(serde_json::json!({ "entries": stats, "total": total }))
        }
    }
}
