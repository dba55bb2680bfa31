use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use forum_import_core::data::target_registry;
use forum_import_core::{
    ImportSession, ImporterRegistry, RunReport, Runner, RunnerOptions, SessionOptions,
    SessionStore, StepDefinition, StepGraph, StepStatus,
};
use forum_import_store_sqlite::{
    IntegrityReport, LogStat, SchemaStatus, SqliteSource, SqliteStore, TableDigest,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::info;

pub const API_CONTRACT_VERSION: &str = "api.v1";
pub const DEFAULT_CHARSET: &str = "utf-8";

/// An import job as written by an administrator, usually in YAML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ImportConfig {
    /// Importer key, for example `reference`.
    pub importer: String,
    /// Legacy database path. Relative paths resolve against the config file's directory.
    pub source: PathBuf,
    /// Steps to run. Empty selects every step.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub retain_ids: bool,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default)]
    pub convert_html: bool,
    #[serde(default)]
    pub step_config: BTreeMap<String, serde_json::Value>,
    /// Per-step batch sizes, merged into each step's config as `limit`. Only paging steps
    /// accept one.
    #[serde(default)]
    pub batch: BTreeMap<String, usize>,
}

fn default_charset() -> String {
    DEFAULT_CHARSET.to_string()
}

impl ImportConfig {
    /// # Errors
    /// Returns an error when the document is not a valid import config.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("failed to parse import config")
    }

    /// Reads a YAML config and resolves its source path against the file's directory.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read import config {}", path.display()))?;
        let mut config = Self::from_yaml_str(&text)
            .with_context(|| format!("invalid import config {}", path.display()))?;
        if config.source.is_relative() {
            if let Some(base) = path.parent() {
                config.source = base.join(&config.source);
            }
        }
        Ok(config)
    }

    /// Session options carrying this config, with `batch` folded into `step_config`.
    ///
    /// # Errors
    /// Returns an error when a step with a batch size has a non-object config.
    pub fn session_options(&self) -> Result<SessionOptions> {
        let mut step_config = self.step_config.clone();
        for (step, limit) in &self.batch {
            let slot = step_config
                .entry(step.clone())
                .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
            if slot.is_null() {
                *slot = serde_json::Value::Object(serde_json::Map::new());
            }
            let Some(object) = slot.as_object_mut() else {
                return Err(anyhow!("step_config.{step} must be a mapping to take a batch size"));
            };
            object.insert("limit".to_string(), serde_json::Value::from(*limit));
        }

        Ok(SessionOptions {
            retain_ids: self.retain_ids,
            charset: self.charset.clone(),
            convert_html: self.convert_html,
            source: serde_json::json!({ "path": self.source.to_string_lossy() }),
            step_config,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepView {
    pub name: String,
    pub status: StepStatus,
    pub start_after: Option<i64>,
    pub end: Option<i64>,
    pub imported: u64,
    pub invocations: u64,
    pub run_time_ms: u64,
}

/// Read model of the stored session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionStatus {
    pub session_id: String,
    pub importer: String,
    pub source: Option<String>,
    pub complete: bool,
    pub current_step: Option<String>,
    pub queue: Vec<String>,
    pub steps: Vec<StepView>,
    /// Sum of the steps' `imported` counts, which leave out rows committed by failed
    /// invocations.
    pub total_imported: u64,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl SessionStatus {
    fn from_session(session: &ImportSession) -> Result<Self> {
        let steps = session
            .steps
            .iter()
            .map(|(name, progress)| StepView {
                name: name.clone(),
                status: progress.status,
                start_after: progress.state.as_ref().map(forum_import_core::StepState::start_after),
                end: progress.state.as_ref().map(forum_import_core::StepState::end),
                imported: progress.imported(),
                invocations: progress.invocations,
                run_time_ms: progress.run_time_ms,
            })
            .collect();

        Ok(Self {
            session_id: session.session_id.to_string(),
            importer: session.importer.clone(),
            source: source_path(&session.options).map(|path| path.to_string_lossy().into_owned()),
            complete: session.is_complete(),
            current_step: session.current_step().map(ToString::to_string),
            queue: session.queue.clone(),
            steps,
            total_imported: session.total_imported(),
            created_at: format_time(session.created_at)?,
            updated_at: format_time(session.updated_at)?,
            completed_at: session.completed_at.map(format_time).transpose()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunResult {
    pub report: RunReport,
    pub session: SessionStatus,
}

/// Budget for one `run` call.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits {
    pub max_time: Duration,
    pub max_invocations: Option<u64>,
    pub batch_limit: Option<usize>,
}

impl Default for RunLimits {
    fn default() -> Self {
        let runner = RunnerOptions::default();
        Self { max_time: runner.max_time, max_invocations: None, batch_limit: runner.batch_limit }
    }
}

/// Importers this build knows, by key.
///
/// # Errors
/// Returns an error when two importers claim the same key.
pub fn importer_registry() -> Result<ImporterRegistry> {
    let mut registry = ImporterRegistry::new();
    forum_import_reference::register(&mut registry)?;
    Ok(registry)
}

#[derive(Debug, Clone)]
pub struct ImportApi {
    db_path: PathBuf,
}

impl ImportApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    fn open_migrated(&self) -> Result<SqliteStore> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when the database cannot be checked.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.open_store()?.integrity_check()
    }

    /// Digests of `tables`, or of every import table when `tables` is empty.
    ///
    /// # Errors
    /// Returns an error when a table is unknown or cannot be read.
    pub fn digest(&self, tables: &[String]) -> Result<Vec<TableDigest>> {
        let store = self.open_migrated()?;
        if tables.is_empty() {
            return store.table_digests();
        }
        tables.iter().map(|table| store.table_digest(table)).collect()
    }

    /// Steps of one importer in run order.
    ///
    /// # Errors
    /// Returns an error for unknown importers or an invalid step graph.
    pub fn list_steps(&self, importer: &str) -> Result<Vec<StepDefinition>> {
        let importer = importer_registry()?.create(importer)?;
        let graph = StepGraph::new(importer.steps())?;
        Ok(graph
            .order()
            .iter()
            .filter_map(|name| graph.get(name).cloned())
            .collect())
    }

    /// Creates and stores a new session for `config`.
    ///
    /// A completed session is replaced; an unfinished one must be reset first.
    ///
    /// # Errors
    /// Returns an error for unknown importers, invalid selections or options, an unreadable
    /// source, or an unfinished session.
    pub fn start_session(&self, config: &ImportConfig) -> Result<SessionStatus> {
        let mut store = self.open_migrated()?;
        if let Some(existing) = store.load_session()? {
            if !existing.is_complete() {
                return Err(anyhow!(
                    "session {} is still running; reset it before starting another",
                    existing.session_id
                ));
            }
        }

        let mut importer = importer_registry()?.create(&config.importer)?;
        let source = SqliteSource::open(&config.source)?;
        let handlers = target_registry()?;
        let runner =
            Runner::new(importer.as_mut(), &source, &handlers, RunnerOptions::default())?;
        let session = runner.start_session(&config.steps, config.session_options()?)?;
        store.save_session(&session)?;

        info!(
            session_id = %session.session_id,
            importer = %session.importer,
            steps = session.queue.len(),
            "started import session"
        );
        SessionStatus::from_session(&session)
    }

    /// # Errors
    /// Returns an error when the stored session cannot be read.
    pub fn status(&self) -> Result<Option<SessionStatus>> {
        let mut store = self.open_migrated()?;
        store.load_session()?.as_ref().map(SessionStatus::from_session).transpose()
    }

    /// Discards one step's progress and queues it again.
    ///
    /// # Errors
    /// Returns an error when no session exists or the step is not part of it.
    pub fn rerun(&self, step: &str) -> Result<SessionStatus> {
        let mut store = self.open_migrated()?;
        let mut session = load_required(&mut store)?;
        let importer = importer_registry()?.create(&session.importer)?;
        let graph = StepGraph::new(importer.steps())?;
        session.rerun(&graph, step)?;
        store.save_session(&session)?;
        info!(step, "queued step to run again");
        SessionStatus::from_session(&session)
    }

    /// Removes the stored session. Imported rows and the import log stay.
    ///
    /// # Errors
    /// Returns an error when the session cannot be removed.
    pub fn reset(&self) -> Result<bool> {
        let mut store = self.open_migrated()?;
        let existed = store.load_session()?.is_some();
        store.clear_session()?;
        if existed {
            info!("cleared import session");
        }
        Ok(existed)
    }

    /// Runs the stored session until it completes or `limits.max_invocations` is reached.
    ///
    /// # Errors
    /// Returns an error when no session exists, the source cannot be opened, or an invocation
    /// fails. Progress from earlier invocations stays persisted.
    pub fn run(&self, limits: RunLimits) -> Result<RunResult> {
        let mut store = self.open_migrated()?;
        let mut session = load_required(&mut store)?;
        let source_path = source_path(&session.options)
            .ok_or_else(|| anyhow!("session {} has no source path", session.session_id))?;
        let source = SqliteSource::open(&source_path)?;

        let mut importer = importer_registry()?.create(&session.importer)?;
        let handlers = target_registry()?;
        let options = RunnerOptions { max_time: limits.max_time, batch_limit: limits.batch_limit };
        let mut runner = Runner::new(importer.as_mut(), &source, &handlers, options)?;
        let report = runner.run(&mut session, &mut store, limits.max_invocations)?;

        info!(
            invocations = report.invocations,
            imported = report.imported,
            complete = report.session_complete,
            "import run finished"
        );
        Ok(RunResult { report, session: SessionStatus::from_session(&session)? })
    }

    /// Target id recorded for one legacy id.
    ///
    /// # Errors
    /// Returns an error when the import log cannot be read.
    pub fn lookup(&self, entity_type: &str, legacy_id: i64) -> Result<Option<i64>> {
        self.open_migrated()?.find_mapping(entity_type, legacy_id)
    }

    /// # Errors
    /// Returns an error when the import log cannot be read.
    pub fn log_stats(&self) -> Result<Vec<LogStat>> {
        self.open_migrated()?.log_stats()
    }
}

fn load_required(store: &mut SqliteStore) -> Result<ImportSession> {
    store
        .load_session()?
        .ok_or_else(|| anyhow!("no import session; start one with a config first"))
}

fn source_path(options: &SessionOptions) -> Option<PathBuf> {
    options.source.get("path").and_then(serde_json::Value::as_str).map(PathBuf::from)
}

fn format_time(value: OffsetDateTime) -> Result<String> {
    value.format(&Rfc3339).context("failed to format timestamp")
}
