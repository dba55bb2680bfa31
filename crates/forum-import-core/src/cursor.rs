use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Resumable progress of one step over its legacy key range.
///
/// `start_after` only moves forward, and once `complete` is set the state is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    start_after: i64,
    end: i64,
    imported: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extra: BTreeMap<String, serde_json::Value>,
    complete: bool,
}

impl StepState {
    #[must_use]
    pub fn new(end: i64) -> Self {
        Self { start_after: 0, end, imported: 0, extra: BTreeMap::new(), complete: false }
    }

    #[must_use]
    pub fn start_after(&self) -> i64 {
        self.start_after
    }

    #[must_use]
    pub fn end(&self) -> i64 {
        self.end
    }

    /// Records inserted by invocations that completed. Rows committed by a failed invocation
    /// are skipped as existing when the step resumes and are not counted, so this can run
    /// below the number of rows the step actually wrote.
    #[must_use]
    pub fn imported(&self) -> u64 {
        self.imported
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Moves the position forward. Positions at or behind the current one are ignored.
    pub fn advance(&mut self, position: i64) {
        if !self.complete && position > self.start_after {
            self.start_after = position;
        }
    }

    pub fn record_import(&mut self) {
        if !self.complete {
            self.imported += 1;
        }
    }

    #[must_use]
    pub fn complete(mut self) -> Self {
        self.complete = true;
        self.extra.clear();
        self
    }

    /// Marks the step complete once the position has reached the recorded end, otherwise
    /// returns the state unchanged for the next invocation.
    #[must_use]
    pub fn resume_if_needed(self) -> Self {
        if !self.complete && self.start_after >= self.end {
            self.complete()
        } else {
            self
        }
    }

    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    #[must_use]
    pub fn extra_i64(&self, key: &str) -> Option<i64> {
        self.extra.get(key).and_then(serde_json::Value::as_i64)
    }

    pub fn set_extra(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        if !self.complete {
            self.extra.insert(key.to_string(), value.into());
        }
    }

    pub fn clear_extra(&mut self) {
        self.extra.clear();
    }
}

/// Wall-clock budget for one step invocation.
///
/// A zero budget is exhausted immediately, so a step processes exactly one record per
/// invocation before yielding.
#[derive(Debug, Clone, Copy)]
pub struct StepTimer {
    started: Instant,
    budget: Duration,
}

impl StepTimer {
    #[must_use]
    pub fn start(budget: Duration) -> Self {
        Self { started: Instant::now(), budget }
    }

    #[must_use]
    pub fn unlimited() -> Self {
        Self::start(Duration::MAX)
    }

    #[must_use]
    pub fn limit_exceeded(&self) -> bool {
        self.started.elapsed() >= self.budget
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.budget
    }
}
