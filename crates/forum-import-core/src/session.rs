use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::cursor::StepState;
use crate::error::{ImportError, ImportResult};
use crate::graph::StepGraph;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    Running,
    Complete,
}

impl StepStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Complete => "complete",
        }
    }
}

impl Display for StepStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = ImportError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(Self::NotStarted),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            other => Err(ImportError::Configuration(format!("unknown step status `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub status: StepStatus,
    pub state: Option<StepState>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub run_time_ms: u64,
    pub invocations: u64,
}

impl StepProgress {
    fn not_started() -> Self {
        Self {
            status: StepStatus::NotStarted,
            state: None,
            started_at: None,
            completed_at: None,
            run_time_ms: 0,
            invocations: 0,
        }
    }

    #[must_use]
    pub fn imported(&self) -> u64 {
        self.state.as_ref().map_or(0, StepState::imported)
    }
}

/// Importer-scoped values shared between steps, such as legacy ids collected by one step for
/// a later one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportContext {
    values: BTreeMap<String, serde_json::Value>,
}

impl ImportContext {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Adds `entry -> value` to the object stored under `key`, creating it when absent.
    pub fn insert_entry(&mut self, key: &str, entry: &str, value: impl Into<serde_json::Value>) {
        let slot = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if !slot.is_object() {
            *slot = serde_json::Value::Object(serde_json::Map::new());
        }
        if let serde_json::Value::Object(map) = slot {
            map.insert(entry.to_string(), value.into());
        }
    }

    #[must_use]
    pub fn entries(&self, key: &str) -> BTreeMap<String, serde_json::Value> {
        match self.values.get(key) {
            Some(serde_json::Value::Object(map)) => {
                map.iter().map(|(entry, value)| (entry.clone(), value.clone())).collect()
            }
            _ => BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOptions {
    pub retain_ids: bool,
    pub charset: String,
    pub convert_html: bool,
    pub source: serde_json::Value,
    pub step_config: BTreeMap<String, serde_json::Value>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            retain_ids: false,
            charset: String::new(),
            convert_html: false,
            source: serde_json::Value::Null,
            step_config: BTreeMap::new(),
        }
    }
}

/// Durable state of one import run: which steps were selected, their progress, and what is
/// left to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSession {
    pub session_id: Ulid,
    pub importer: String,
    pub options: SessionOptions,
    /// Remaining steps, in run order. The head is the current step.
    pub queue: Vec<String>,
    pub steps: BTreeMap<String, StepProgress>,
    #[serde(default)]
    pub context: ImportContext,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl ImportSession {
    /// Starts a session over `selected` steps, or every step when the selection is empty.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when a selected step is unknown or depends on a
    /// step that is not selected.
    pub fn new(
        importer: &str,
        graph: &StepGraph,
        selected: &[String],
        options: SessionOptions,
    ) -> ImportResult<Self> {
        let selection: BTreeSet<String> = if selected.is_empty() {
            graph.order().iter().cloned().collect()
        } else {
            selected.iter().cloned().collect()
        };

        for name in &selection {
            let Some(step) = graph.get(name) else {
                return Err(ImportError::Configuration(format!(
                    "importer `{importer}` has no step `{name}`"
                )));
            };
            for dependency in &step.depends_on {
                if !selection.contains(dependency) {
                    return Err(ImportError::Configuration(format!(
                        "step `{name}` depends on `{dependency}`, which is not selected"
                    )));
                }
            }
        }

        let queue = graph.order_selection(&selection);
        let steps =
            queue.iter().map(|name| (name.clone(), StepProgress::not_started())).collect();
        let now = OffsetDateTime::now_utc();

        Ok(Self {
            session_id: Ulid::new(),
            importer: importer.to_string(),
            options,
            queue,
            steps,
            context: ImportContext::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.queue.first().map(String::as_str)
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn progress(&self, step: &str) -> Option<&StepProgress> {
        self.steps.get(step)
    }

    #[must_use]
    pub fn total_imported(&self) -> u64 {
        self.steps.values().map(StepProgress::imported).sum()
    }

    /// Discards a step's progress and queues it to run again.
    ///
    /// # Errors
    /// Returns `ImportError::Configuration` when the step was not part of this session.
    pub fn rerun(&mut self, graph: &StepGraph, step: &str) -> ImportResult<()> {
        if !self.steps.contains_key(step) {
            return Err(ImportError::Configuration(format!(
                "step `{step}` is not part of this session"
            )));
        }
        self.reset_step(graph, step);
        self.completed_at = None;
        self.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    /// Resets every completed step that `completed` forces and returns their names.
    pub fn apply_forces(&mut self, graph: &StepGraph, completed: &str) -> Vec<String> {
        let mut forced = Vec::new();
        for target in graph.forced_by(completed) {
            let reset = self
                .steps
                .get(target)
                .is_some_and(|progress| progress.status != StepStatus::NotStarted);
            if reset {
                self.reset_step(graph, target);
                forced.push(target.clone());
            }
        }
        forced
    }

    pub(crate) fn finish_current(&mut self, graph: &StepGraph) -> Vec<String> {
        let Some(step) = self.queue.first().cloned() else {
            return Vec::new();
        };
        self.queue.remove(0);
        let now = OffsetDateTime::now_utc();
        if let Some(progress) = self.steps.get_mut(&step) {
            progress.status = StepStatus::Complete;
            progress.completed_at = Some(now);
        }
        let forced = self.apply_forces(graph, &step);
        if self.queue.is_empty() {
            self.completed_at = Some(now);
        }
        forced
    }

    fn reset_step(&mut self, graph: &StepGraph, step: &str) {
        self.steps.insert(step.to_string(), StepProgress::not_started());
        if self.queue.iter().any(|queued| queued == step) {
            return;
        }
        let rank = graph.rank(step).unwrap_or(usize::MAX);
        let position = self
            .queue
            .iter()
            .position(|queued| graph.rank(queued).unwrap_or(usize::MAX) > rank)
            .unwrap_or(self.queue.len());
        self.queue.insert(position, step.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::StepDefinition;

    fn graph() -> StepGraph {
        StepGraph::new(vec![
            StepDefinition::new("user_groups", "User groups"),
            StepDefinition::new("users", "Users").depends_on(&["user_groups"]),
            StepDefinition::new("forums", "Forums"),
            StepDefinition::new("threads", "Threads").depends_on(&["forums"]).forces(&["posts"]),
            StepDefinition::new("posts", "Posts").depends_on(&["threads"]),
        ])
        .unwrap_or_else(|err| panic!("test graph should be valid: {err}"))
    }

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn empty_selection_runs_everything_in_order() -> ImportResult<()> {
        let session = ImportSession::new("test", &graph(), &[], SessionOptions::default())?;
        assert_eq!(session.queue, ["user_groups", "users", "forums", "threads", "posts"]);
        assert_eq!(session.current_step(), Some("user_groups"));
        Ok(())
    }

    #[test]
    fn selection_missing_a_dependency_is_rejected() {
        let result =
            ImportSession::new("test", &graph(), &names(&["users"]), SessionOptions::default());
        assert!(matches!(
            result,
            Err(ImportError::Configuration(message)) if message.contains("user_groups")
        ));
    }

    #[test]
    fn unknown_selection_is_rejected() {
        let result =
            ImportSession::new("test", &graph(), &names(&["polls"]), SessionOptions::default());
        assert!(matches!(result, Err(ImportError::Configuration(_))));
    }

    #[test]
    fn completing_a_forcing_step_requeues_its_target() -> ImportResult<()> {
        let graph = graph();
        let mut session = ImportSession::new(
            "test",
            &graph,
            &names(&["forums", "threads", "posts"]),
            SessionOptions::default(),
        )?;

        session.finish_current(&graph);
        session.finish_current(&graph);
        assert!(session.finish_current(&graph).is_empty());
        assert!(session.is_complete());

        session.rerun(&graph, "threads")?;
        assert_eq!(session.queue, ["threads"]);
        let forced = session.finish_current(&graph);
        assert_eq!(forced, ["posts"]);
        assert_eq!(session.queue, ["posts"]);
        assert_eq!(session.progress("posts").map(|p| p.status), Some(StepStatus::NotStarted));
        Ok(())
    }

    #[test]
    fn rerun_inserts_in_dependency_order() -> ImportResult<()> {
        let graph = graph();
        let mut session = ImportSession::new("test", &graph, &[], SessionOptions::default())?;
        session.finish_current(&graph);
        session.finish_current(&graph);
        assert_eq!(session.current_step(), Some("forums"));

        session.rerun(&graph, "user_groups")?;
        assert_eq!(session.queue, ["user_groups", "forums", "threads", "posts"]);
        assert!(session.rerun(&graph, "polls").is_err());
        Ok(())
    }

    #[test]
    fn context_entries_accumulate() {
        let mut context = ImportContext::default();
        context.insert_entry("super_moderators", "12", 40);
        context.insert_entry("super_moderators", "15", 41);
        let entries = context.entries("super_moderators");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries.get("15"), Some(&serde_json::json!(41)));
    }

    #[test]
    fn session_round_trips_through_json() -> Result<(), serde_json::Error> {
        let session = ImportSession::new("test", &graph(), &[], SessionOptions::default())
            .unwrap_or_else(|err| panic!("session should start: {err}"));
        let decoded: ImportSession = serde_json::from_str(&serde_json::to_string(&session)?)?;
        assert_eq!(decoded.session_id, session.session_id);
        assert_eq!(decoded.queue, session.queue);
        Ok(())
    }
}
