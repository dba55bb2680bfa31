use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cursor::{StepState, StepTimer};
use crate::data::rebuild_node_tree;
use crate::error::{ImportError, ImportResult};
use crate::graph::{StepDefinition, StepGraph};
use crate::handler::{DeferredTask, ImportTarget};
use crate::registry::HandlerRegistry;
use crate::session::{ImportContext, ImportSession, SessionOptions, StepStatus};
use crate::source::SourceRows;
use crate::storage::RunnerStore;
use crate::text::TextConverter;

pub const DEFAULT_MAX_TIME: Duration = Duration::from_secs(8);

/// Everything a step needs for one invocation.
pub struct StepContext<'r, 'a> {
    pub source: &'r dyn SourceRows,
    pub target: &'r mut ImportTarget<'a>,
    /// Per-step configuration from the session, `Null` when none was given.
    pub config: &'r serde_json::Value,
    pub context: &'r mut ImportContext,
    pub timer: StepTimer,
    pub batch_limit: Option<usize>,
}

impl StepContext<'_, '_> {
    /// Rows to fetch per invocation: the step's `limit` setting, else the run's batch
    /// limit, else `default`.
    #[must_use]
    pub fn limit(&self, default: usize) -> usize {
        self.config
            .get("limit")
            .and_then(serde_json::Value::as_u64)
            .and_then(|limit| usize::try_from(limit).ok())
            .or(self.batch_limit)
            .unwrap_or(default)
            .max(1)
    }

    #[must_use]
    pub fn limit_exceeded(&self) -> bool {
        self.timer.limit_exceeded()
    }
}

/// A source platform: its steps and how each one copies a slice of legacy data.
pub trait Importer {
    fn key(&self) -> &'static str;

    fn title(&self) -> &'static str;

    fn steps(&self) -> Vec<StepDefinition>;

    /// # Errors
    /// Returns `ImportError::Configuration` when the importer cannot run with `options`.
    fn validate_options(&self, _options: &SessionOptions) -> ImportResult<()> {
        Ok(())
    }

    /// Upper bound of the step's legacy key range, read once when the step starts.
    ///
    /// # Errors
    /// Returns `ImportError::Source` when the bound cannot be read.
    fn step_end(&self, _step: &str, _source: &dyn SourceRows) -> ImportResult<i64> {
        Ok(0)
    }

    /// Imports as much of `step` as the context's budget allows, starting from `state`.
    ///
    /// # Errors
    /// Storage, source and configuration errors abort the invocation.
    fn run_step(
        &mut self,
        step: &str,
        state: StepState,
        ctx: &mut StepContext<'_, '_>,
    ) -> ImportResult<StepState>;
}

#[derive(Debug, Clone, Copy)]
pub struct RunnerOptions {
    pub max_time: Duration,
    pub batch_limit: Option<usize>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self { max_time: DEFAULT_MAX_TIME, batch_limit: None }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Resumable,
    StepComplete,
    SessionComplete,
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct InvocationReport {
    pub step: Option<String>,
    pub status: InvocationStatus,
    pub start_after: i64,
    pub end: i64,
    /// Records the step has imported since it last started.
    pub step_imported: u64,
    /// Records imported by this invocation alone.
    pub imported: u64,
    pub forced: Vec<String>,
}

#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize)]
pub struct RunReport {
    pub invocations: u64,
    pub imported: u64,
    pub completed_steps: Vec<String>,
    pub forced_steps: Vec<String>,
    pub current_step: Option<String>,
    pub session_complete: bool,
}

/// Drives an importer's steps in dependency order, one time-boxed invocation at a time.
pub struct Runner<'a> {
    importer: &'a mut dyn Importer,
    graph: StepGraph,
    source: &'a dyn SourceRows,
    registry: &'a HandlerRegistry,
    options: RunnerOptions,
}

impl<'a> Runner<'a> {
    /// # Errors
    /// Returns `ImportError::Configuration` when the importer's steps do not form a valid
    /// graph.
    pub fn new(
        importer: &'a mut dyn Importer,
        source: &'a dyn SourceRows,
        registry: &'a HandlerRegistry,
        options: RunnerOptions,
    ) -> ImportResult<Self> {
        let graph = StepGraph::new(importer.steps())?;
        Ok(Self { importer, graph, source, registry, options })
    }

    #[must_use]
    pub fn graph(&self) -> &StepGraph {
        &self.graph
    }

    /// # Errors
    /// Returns `ImportError::Configuration` for invalid selections or options.
    pub fn start_session(
        &self,
        selected: &[String],
        options: SessionOptions,
    ) -> ImportResult<ImportSession> {
        for (step, config) in &options.step_config {
            let Some(definition) = self.graph.get(step) else {
                continue;
            };
            if !definition.batched && config.get("limit").is_some() {
                return Err(ImportError::Configuration(format!(
                    "step `{step}` imports in a single pass and takes no batch size"
                )));
            }
        }
        self.importer.validate_options(&options)?;
        TextConverter::for_label(&options.charset, options.convert_html)?;
        ImportSession::new(self.importer.key(), &self.graph, selected, options)
    }

    /// Runs the current step for one time budget and persists the session afterwards.
    ///
    /// On error the session is not persisted, so the stored cursor stays at the last good
    /// position and records committed during the failed invocation are deduplicated on resume.
    /// Deferred tasks queued by those records still run. The records themselves are never
    /// added to the step's `imported` count.
    ///
    /// # Errors
    /// Returns the step's storage, source or configuration error, or the error persisting the
    /// session.
    pub fn run_invocation(
        &mut self,
        session: &mut ImportSession,
        store: &mut dyn RunnerStore,
    ) -> ImportResult<InvocationReport> {
        if session.importer != self.importer.key() {
            return Err(ImportError::Configuration(format!(
                "session belongs to importer `{}`, not `{}`",
                session.importer,
                self.importer.key()
            )));
        }

        let Some(step) = session.current_step().map(ToString::to_string) else {
            return Ok(InvocationReport {
                step: None,
                status: InvocationStatus::SessionComplete,
                start_after: 0,
                end: 0,
                step_imported: 0,
                imported: 0,
                forced: Vec::new(),
            });
        };
        if !self.graph.contains(&step) {
            return Err(ImportError::Configuration(format!("session step `{step}` is unknown")));
        }

        let progress = session.steps.get(&step).cloned();
        let state = match progress.and_then(|progress| progress.state) {
            Some(state) if !state.is_complete() => state,
            _ => {
                let end = self.importer.step_end(&step, self.source)?;
                info!(step, end, "starting step");
                StepState::new(end)
            }
        };
        let imported_before = state.imported();

        let text = TextConverter::for_label(&session.options.charset, session.options.convert_html)?;
        let config = session.options.step_config.get(&step).cloned().unwrap_or_default();
        let mut context = session.context.clone();
        let timer = StepTimer::start(self.options.max_time);

        let (result, deferred) = {
            let mut target = ImportTarget::new(
                store.as_import_store(),
                self.registry,
                session.options.retain_ids,
                text,
            );
            let mut ctx = StepContext {
                source: self.source,
                target: &mut target,
                config: &config,
                context: &mut context,
                timer,
                batch_limit: self.options.batch_limit,
            };
            let result = self.importer.run_step(&step, state, &mut ctx);
            (result, target.take_deferred())
        };

        let state = match result {
            Ok(state) => state,
            Err(err) => {
                warn!(step, error = %err, "step invocation failed, keeping last saved position");
                // Committed records resume as existing and never queue this work again.
                for task in deferred {
                    if let Err(task_err) = run_deferred(task, store) {
                        warn!(step, task = task.as_str(), error = %task_err, "deferred task failed");
                    }
                }
                return Err(err);
            }
        };

        for task in deferred {
            run_deferred(task, store)?;
        }

        let now = OffsetDateTime::now_utc();
        let elapsed_ms = u64::try_from(timer.elapsed().as_millis()).unwrap_or(u64::MAX);
        if let Some(progress) = session.steps.get_mut(&step) {
            progress.status = StepStatus::Running;
            progress.started_at.get_or_insert(now);
            progress.state = Some(state.clone());
            progress.run_time_ms = progress.run_time_ms.saturating_add(elapsed_ms);
            progress.invocations += 1;
        }
        session.context = context;
        session.updated_at = now;

        let mut report = InvocationReport {
            step: Some(step.clone()),
            status: InvocationStatus::Resumable,
            start_after: state.start_after(),
            end: state.end(),
            step_imported: state.imported(),
            imported: state.imported().saturating_sub(imported_before),
            forced: Vec::new(),
        };

        if state.is_complete() {
            report.forced = session.finish_current(&self.graph);
            report.status = InvocationStatus::StepComplete;
            info!(step, imported = state.imported(), forced = ?report.forced, "step complete");
        } else {
            debug!(step, start_after = state.start_after(), end = state.end(), "step resumable");
        }

        store.save_session(session)?;
        Ok(report)
    }

    /// Runs invocations until the session completes or `max_invocations` is reached.
    ///
    /// # Errors
    /// Stops at the first failed invocation and returns its error.
    pub fn run(
        &mut self,
        session: &mut ImportSession,
        store: &mut dyn RunnerStore,
        max_invocations: Option<u64>,
    ) -> ImportResult<RunReport> {
        let mut report = RunReport::default();

        while max_invocations.map_or(true, |max| report.invocations < max) {
            let invocation = self.run_invocation(session, store)?;
            if invocation.status == InvocationStatus::SessionComplete {
                break;
            }
            report.invocations += 1;
            report.imported += invocation.imported;
            report.forced_steps.extend(invocation.forced);
            if invocation.status == InvocationStatus::StepComplete {
                report.completed_steps.extend(invocation.step);
            }
        }

        report.current_step = session.current_step().map(ToString::to_string);
        report.session_complete = session.is_complete();
        Ok(report)
    }
}

fn run_deferred(task: DeferredTask, store: &mut dyn RunnerStore) -> ImportResult<()> {
    debug!(task = task.as_str(), "running deferred task");
    let store = store.as_import_store();
    store.begin()?;
    let result = match task {
        DeferredTask::RebuildNodeTree => rebuild_node_tree(store).map(|_| ()),
    };
    match result {
        Ok(()) => store.commit(),
        Err(err) => {
            if let Err(rollback_err) = store.rollback() {
                warn!(error = %rollback_err, "rollback of deferred task failed");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{target_registry, NodeHandler};
    use crate::handler::RecordHandler;
    use crate::memory::{MemorySource, MemoryStore};
    use crate::schema::{Column, ColumnType, TableSchema};
    use crate::source::SourceQuery;
    use crate::storage::SessionStore;
    use crate::value::{RowExt, Value};

    /// Copies `legacy_tag` rows into `tag`; `links` depends on tags and is forced by them.
    struct TagImporter;

    impl Importer for TagImporter {
        fn key(&self) -> &'static str {
            "tags"
        }

        fn title(&self) -> &'static str {
            "Tags"
        }

        fn steps(&self) -> Vec<StepDefinition> {
            vec![
                StepDefinition::new("tags", "Tags").forces(&["links"]).batched(),
                StepDefinition::new("links", "Links").depends_on(&["tags"]),
            ]
        }

        fn step_end(&self, step: &str, source: &dyn SourceRows) -> ImportResult<i64> {
            match step {
                "tags" => source.max_key("legacy_tag", "tagid"),
                _ => Ok(0),
            }
        }

        fn run_step(
            &mut self,
            step: &str,
            mut state: StepState,
            ctx: &mut StepContext<'_, '_>,
        ) -> ImportResult<StepState> {
            if step == "links" {
                ctx.context.set("links_ran", true);
                return Ok(state.complete());
            }

            let rows = ctx.source.fetch(
                &SourceQuery::new("legacy_tag", "tagid")
                    .range(state.start_after(), state.end())
                    .limit(ctx.limit(100)),
            )?;
            if rows.is_empty() {
                return Ok(state.complete());
            }

            for row in rows {
                let legacy_id = row.int("tagid");
                state.advance(legacy_id);
                let mut handler = ctx.target.new_handler("tag")?;
                match handler.set("tag", row.value("tag")) {
                    Ok(()) => {}
                    Err(err) if err.is_record_level() => continue,
                    Err(err) => return Err(err),
                }
                match ctx.target.save(handler.as_mut(), Some(legacy_id)) {
                    Ok(outcome) if outcome.is_inserted() => state.record_import(),
                    Ok(_) => {}
                    Err(err) if err.is_record_level() => {}
                    Err(err) => return Err(err),
                }
                if ctx.limit_exceeded() {
                    break;
                }
            }
            Ok(state.resume_if_needed())
        }
    }

    /// Imports `legacy_node` rows as forums, optionally failing right after the first save.
    struct NodeImporter {
        fail_after_save: bool,
    }

    impl Importer for NodeImporter {
        fn key(&self) -> &'static str {
            "nodes"
        }

        fn title(&self) -> &'static str {
            "Nodes"
        }

        fn steps(&self) -> Vec<StepDefinition> {
            vec![StepDefinition::new("nodes", "Nodes")]
        }

        fn step_end(&self, _step: &str, source: &dyn SourceRows) -> ImportResult<i64> {
            source.max_key("legacy_node", "nodeid")
        }

        fn run_step(
            &mut self,
            _step: &str,
            mut state: StepState,
            ctx: &mut StepContext<'_, '_>,
        ) -> ImportResult<StepState> {
            let rows = ctx.source.fetch(
                &SourceQuery::new("legacy_node", "nodeid").range(state.start_after(), state.end()),
            )?;
            for row in rows {
                let legacy_id = row.int("nodeid");
                state.advance(legacy_id);
                let mut node: NodeHandler = ctx.target.handler()?;
                node.set("title", row.value("title"))?;
                node.set("display_order", Value::Int(legacy_id))?;
                let forum = ctx.target.new_handler("forum")?;
                node.set_type_data("Forum", forum)?;
                if ctx.target.save(&mut node, Some(legacy_id))?.is_inserted() {
                    state.record_import();
                }
                if self.fail_after_save {
                    return Err(ImportError::Source("legacy connection lost".to_string()));
                }
            }
            Ok(state.complete())
        }
    }

    fn node_source(count: i64) -> MemorySource {
        let mut source = MemorySource::new();
        for nodeid in 1..=count {
            source.insert_values(
                "legacy_node",
                [("nodeid", Value::Int(nodeid)), ("title", Value::from(format!("Forum {nodeid}")))],
            );
        }
        source
    }

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_plain(
                TableSchema::new("tag", "tag", &["tag_id"])
                    .with_column(Column::new("tag_id", ColumnType::Uint).auto_increment())
                    .with_column(Column::new("tag", ColumnType::Str).max_length(20).required()),
            )
            .unwrap_or_else(|err| panic!("tag registration failed: {err}"));
        registry
    }

    fn source(count: i64) -> MemorySource {
        let mut source = MemorySource::new();
        for tagid in 1..=count {
            let tag = if tagid == 3 { String::new() } else { format!("tag-{tagid}") };
            source.insert_values("legacy_tag", [("tagid", Value::Int(tagid)), ("tag", Value::from(tag))]);
        }
        source
    }

    fn zero_budget() -> RunnerOptions {
        RunnerOptions { max_time: Duration::ZERO, batch_limit: None }
    }

    #[test]
    fn zero_budget_processes_one_record_per_invocation() -> ImportResult<()> {
        let registry = registry();
        let source = source(5);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let mut runner = Runner::new(&mut importer, &source, &registry, zero_budget())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;

        let first = runner.run_invocation(&mut session, &mut store)?;
        assert_eq!(first.status, InvocationStatus::Resumable);
        assert_eq!(first.start_after, 1);
        assert_eq!(first.imported, 1);

        let report = runner.run(&mut session, &mut store, None)?;
        assert!(report.session_complete);
        assert_eq!(report.completed_steps, ["tags", "links"]);
        assert_eq!(store.rows("tag").len(), 4);
        assert_eq!(session.progress("tags").map(|p| p.imported()), Some(4));
        assert_eq!(session.context.get("links_ran"), Some(&serde_json::json!(true)));
        Ok(())
    }

    #[test]
    fn session_is_persisted_after_each_invocation() -> ImportResult<()> {
        let registry = registry();
        let source = source(3);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let mut runner = Runner::new(&mut importer, &source, &registry, zero_budget())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;

        runner.run(&mut session, &mut store, Some(2))?;
        let saved = store.load_session()?.unwrap_or_else(|| panic!("session not saved"));
        let state = saved.progress("tags").and_then(|p| p.state.clone());
        assert_eq!(state.map(|s| s.start_after()), Some(2));
        Ok(())
    }

    #[test]
    fn storage_failure_keeps_last_saved_cursor_and_resume_has_no_duplicates() -> ImportResult<()> {
        let registry = registry();
        let source = source(6);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let options = RunnerOptions { max_time: Duration::MAX, batch_limit: Some(2) };
        let mut runner = Runner::new(&mut importer, &source, &registry, options)?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;

        runner.run_invocation(&mut session, &mut store)?;
        store.fail_inserts_into("tag");
        assert!(matches!(
            runner.run_invocation(&mut session, &mut store),
            Err(ImportError::Storage(_))
        ));
        let saved = store.load_session()?.unwrap_or_else(|| panic!("session not saved"));
        let cursor = saved.progress("tags").and_then(|p| p.state.clone()).map(|s| s.start_after());
        assert_eq!(cursor, Some(2));

        store.clear_failure();
        let mut resumed = saved;
        runner.run(&mut resumed, &mut store, None)?;
        assert_eq!(store.rows("tag").len(), 5);
        assert_eq!(store.log_len(), 5);
        Ok(())
    }

    #[test]
    fn failed_invocation_still_rebuilds_tree_for_committed_nodes() -> ImportResult<()> {
        let registry = target_registry()?;
        let source = node_source(1);
        let mut store = MemoryStore::for_registry(&registry);
        let mut failing = NodeImporter { fail_after_save: true };
        let mut runner = Runner::new(&mut failing, &source, &registry, RunnerOptions::default())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;

        assert!(matches!(
            runner.run_invocation(&mut session, &mut store),
            Err(ImportError::Source(_))
        ));
        let nodes = store.rows("node");
        assert_eq!(nodes.len(), 1);
        assert_eq!((nodes[0].int("lft"), nodes[0].int("rgt")), (1, 2));
        assert_eq!(store.transaction_depth(), 0);

        let mut importer = NodeImporter { fail_after_save: false };
        let mut runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;
        let report = runner.run(&mut session, &mut store, None)?;
        assert!(report.session_complete);
        let nodes = store.rows("node");
        assert_eq!(nodes.len(), 1);
        assert_eq!((nodes[0].int("lft"), nodes[0].int("rgt"), nodes[0].int("depth")), (1, 2, 0));
        Ok(())
    }

    #[test]
    fn rows_committed_by_a_failed_invocation_are_not_counted_as_imported() -> ImportResult<()> {
        let registry = target_registry()?;
        let source = node_source(2);
        let mut store = MemoryStore::for_registry(&registry);
        let mut failing = NodeImporter { fail_after_save: true };
        let mut runner = Runner::new(&mut failing, &source, &registry, RunnerOptions::default())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;
        assert!(runner.run_invocation(&mut session, &mut store).is_err());
        assert_eq!(session.progress("nodes").map(|p| p.imported()), Some(0));

        let mut importer = NodeImporter { fail_after_save: false };
        let mut runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;
        let report = runner.run(&mut session, &mut store, None)?;
        assert!(report.session_complete);
        assert_eq!(store.rows("node").len(), 2);
        assert_eq!(store.log_entries().keys().filter(|(kind, _)| kind == "node").count(), 2);
        assert_eq!(report.imported, 1);
        assert_eq!(session.total_imported(), 1);

        let nodes = store.rows("node");
        let tree: Vec<(i64, i64)> =
            nodes.iter().map(|node| (node.int("lft"), node.int("rgt"))).collect();
        assert_eq!(tree, [(1, 2), (3, 4)]);
        Ok(())
    }

    #[test]
    fn batch_size_is_rejected_for_single_pass_steps() -> ImportResult<()> {
        let registry = registry();
        let source = source(1);
        let mut importer = TagImporter;
        let runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;

        let mut options = SessionOptions::default();
        options.step_config.insert("tags".to_string(), serde_json::json!({ "limit": 10 }));
        assert!(runner.start_session(&[], options.clone()).is_ok());

        options.step_config.insert("links".to_string(), serde_json::json!({ "limit": 10 }));
        let err = runner.start_session(&[], options).err();
        assert!(
            matches!(&err, Some(ImportError::Configuration(message)) if message.contains("`links`")),
            "{err:?}"
        );
        Ok(())
    }

    #[test]
    fn rerunning_a_forcing_step_requeues_forced_step() -> ImportResult<()> {
        let registry = registry();
        let source = source(2);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let mut runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;
        runner.run(&mut session, &mut store, None)?;

        let graph = runner.graph().clone();
        session.rerun(&graph, "tags")?;
        let report = runner.run(&mut session, &mut store, None)?;
        assert_eq!(report.forced_steps, ["links"]);
        assert_eq!(report.completed_steps, ["tags", "links"]);
        assert_eq!(report.imported, 0);
        assert_eq!(store.rows("tag").len(), 2);
        Ok(())
    }

    #[test]
    fn completed_session_reports_complete_without_work() -> ImportResult<()> {
        let registry = registry();
        let source = source(1);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let mut runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;
        runner.run(&mut session, &mut store, None)?;

        let again = runner.run_invocation(&mut session, &mut store)?;
        assert_eq!(again.status, InvocationStatus::SessionComplete);
        Ok(())
    }

    #[test]
    fn session_for_other_importer_is_rejected() -> ImportResult<()> {
        let registry = registry();
        let source = source(1);
        let mut store = MemoryStore::for_registry(&registry);
        let mut importer = TagImporter;
        let mut runner = Runner::new(&mut importer, &source, &registry, RunnerOptions::default())?;
        let mut session = runner.start_session(&[], SessionOptions::default())?;
        session.importer = "phpbb".to_string();
        assert!(matches!(
            runner.run_invocation(&mut session, &mut store),
            Err(ImportError::Configuration(_))
        ));
        Ok(())
    }
}
