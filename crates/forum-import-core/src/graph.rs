use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, ImportResult};

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub name: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Steps whose completed progress is discarded when this step completes again.
    #[serde(default)]
    pub forces: Vec<String>,
    /// Whether the step pages through its source and accepts a `limit` batch size.
    #[serde(default)]
    pub batched: bool,
}

impl StepDefinition {
    #[must_use]
    pub fn new(name: &str, title: &str) -> Self {
        Self {
            name: name.to_string(),
            title: title.to_string(),
            depends_on: Vec::new(),
            forces: Vec::new(),
            batched: false,
        }
    }

    #[must_use]
    pub fn depends_on(mut self, steps: &[&str]) -> Self {
        self.depends_on = steps.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn forces(mut self, steps: &[&str]) -> Self {
        self.forces = steps.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn batched(mut self) -> Self {
        self.batched = true;
        self
    }
}

/// Validated dependency graph of an importer's steps.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<StepDefinition>,
    index: BTreeMap<String, usize>,
    order: Vec<String>,
}

impl StepGraph {
    /// # Errors
    /// Returns `ImportError::Configuration` for duplicate names, references to undeclared
    /// steps, dependency cycles, and forced steps that do not transitively depend on the step
    /// forcing them.
    pub fn new(steps: Vec<StepDefinition>) -> ImportResult<Self> {
        let mut index = BTreeMap::new();
        for (position, step) in steps.iter().enumerate() {
            if index.insert(step.name.clone(), position).is_some() {
                return Err(ImportError::Configuration(format!(
                    "step `{}` is declared more than once",
                    step.name
                )));
            }
        }

        for step in &steps {
            for reference in step.depends_on.iter().chain(step.forces.iter()) {
                if !index.contains_key(reference) {
                    return Err(ImportError::Configuration(format!(
                        "step `{}` references unknown step `{reference}`",
                        step.name
                    )));
                }
                if *reference == step.name {
                    return Err(ImportError::Configuration(format!(
                        "step `{}` references itself",
                        step.name
                    )));
                }
            }
        }

        let order = topological_order(&steps, &index)?;
        let graph = Self { steps, index, order };

        for step in &graph.steps {
            for forced in &step.forces {
                if !graph.transitive_dependencies(forced).contains(&step.name) {
                    return Err(ImportError::Configuration(format!(
                        "step `{}` forces `{forced}`, which does not depend on it",
                        step.name
                    )));
                }
            }
        }

        Ok(graph)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|position| &self.steps[*position])
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    #[must_use]
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// All steps, dependencies first. Ties keep declaration order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Position of a step within [`StepGraph::order`].
    #[must_use]
    pub fn rank(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|step| step == name)
    }

    /// The selected steps in run order.
    #[must_use]
    pub fn order_selection(&self, selected: &BTreeSet<String>) -> Vec<String> {
        self.order.iter().filter(|step| selected.contains(*step)).cloned().collect()
    }

    #[must_use]
    pub fn forced_by(&self, name: &str) -> &[String] {
        self.get(name).map_or(&[][..], |step| step.forces.as_slice())
    }

    #[must_use]
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<&str> = vec![name];
        while let Some(current) = pending.pop() {
            let Some(step) = self.get(current) else {
                continue;
            };
            for dependency in &step.depends_on {
                if seen.insert(dependency.clone()) {
                    pending.push(dependency);
                }
            }
        }
        seen
    }
}

fn topological_order(
    steps: &[StepDefinition],
    index: &BTreeMap<String, usize>,
) -> ImportResult<Vec<String>> {
    let mut remaining_deps: Vec<usize> = steps
        .iter()
        .map(|step| step.depends_on.iter().collect::<BTreeSet<_>>().len())
        .collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (position, step) in steps.iter().enumerate() {
        for dependency in step.depends_on.iter().collect::<BTreeSet<_>>() {
            if let Some(parent) = index.get(dependency) {
                dependents[*parent].push(position);
            }
        }
    }

    let mut ready: BTreeSet<usize> =
        remaining_deps.iter().enumerate().filter(|(_, count)| **count == 0).map(|(p, _)| p).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(next) = ready.pop_first() {
        order.push(steps[next].name.clone());
        for dependent in &dependents[next] {
            remaining_deps[*dependent] -= 1;
            if remaining_deps[*dependent] == 0 {
                ready.insert(*dependent);
            }
        }
    }

    if order.len() != steps.len() {
        let blocked: Vec<&str> = steps
            .iter()
            .filter(|step| !order.contains(&step.name))
            .map(|step| step.name.as_str())
            .collect();
        return Err(ImportError::Configuration(format!(
            "step dependencies form a cycle through: {}",
            blocked.join(", ")
        )));
    }

    Ok(order)
}
