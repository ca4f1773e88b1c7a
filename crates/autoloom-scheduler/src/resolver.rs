//! Dependency resolver: validates a workflow's task graph and turns it into
//! batches of jobs, each batch depending only on earlier ones.

use std::collections::{BTreeMap, BTreeSet};

use autoloom_core::config::SchedulerConfig;
use autoloom_core::error::{GraphError, Result};
use autoloom_core::types::{Job, TriggerSpec, Workflow};

use crate::registry::TaskRegistry;
use crate::trigger;

/// Per-job defaults applied to every resolved task.
#[derive(Debug, Clone, Copy)]
pub struct ResolveOptions {
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl From<&SchedulerConfig> for ResolveOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.default_max_retries,
            timeout_secs: config.default_timeout_secs,
        }
    }
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self::from(&SchedulerConfig::default())
    }
}

/// Resolve with default job options.
pub fn resolve(workflow: &Workflow, registry: &TaskRegistry) -> Result<Vec<Vec<Job>>> {
    resolve_with(workflow, registry, ResolveOptions::default())
}

/// Validate the workflow and order its jobs into ready batches.
///
/// Checks run in order: duplicate names, unknown dependencies, unknown task
/// types, parameters and triggers, cycles. Tasks without a trigger run once
/// when the workflow is created, or after their dependencies if they have any.
pub fn resolve_with(
    workflow: &Workflow,
    registry: &TaskRegistry,
    options: ResolveOptions,
) -> Result<Vec<Vec<Job>>> {
    let mut seen = BTreeSet::new();
    for task in &workflow.tasks {
        if !seen.insert(task.name.as_str()) {
            return Err(GraphError::DuplicateTask(task.name.clone()).into());
        }
    }

    for task in &workflow.tasks {
        if let Some(dep) = task.depends_on.iter().find(|d| !seen.contains(d.as_str())) {
            return Err(GraphError::UnknownDependency {
                task: task.name.clone(),
                dependency: dep.clone(),
            }
            .into());
        }
    }

    for task in &workflow.tasks {
        if !registry.contains(&task.task_type) {
            return Err(GraphError::UnknownTaskType {
                task: task.name.clone(),
                task_type: task.task_type.clone(),
            }
            .into());
        }
    }

    for task in &workflow.tasks {
        registry.validate_params(&task.task_type, &task.parameters)?;
        if let Some(trigger) = &task.trigger {
            trigger::validate(trigger)?;
        }
    }

    let batches = topological_batches(workflow)?;

    Ok(batches
        .into_iter()
        .map(|names| {
            names
                .into_iter()
                .filter_map(|name| workflow.task(name))
                .map(|task| {
                    let trigger = match &task.trigger {
                        Some(trigger) => trigger.clone(),
                        None if task.depends_on.is_empty() => TriggerSpec::once(workflow.created_at),
                        None => TriggerSpec::OnDependencySatisfied,
                    };
                    let mut job = Job::new(
                        workflow.job_id_for(&task.name),
                        &task.name,
                        &task.task_type,
                        task.parameters.clone(),
                        trigger,
                        options.max_retries,
                        options.timeout_secs,
                    );
                    job.workflow_id = Some(workflow.id.clone());
                    job.depends_on = task
                        .depends_on
                        .iter()
                        .map(|dep| workflow.job_id_for(dep))
                        .collect();
                    job.created_at = workflow.created_at;
                    job
                })
                .collect()
        })
        .collect())
}

/// Kahn's algorithm over task names. Each batch is sorted by name.
fn topological_batches(workflow: &Workflow) -> std::result::Result<Vec<Vec<&str>>, GraphError> {
    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for task in &workflow.tasks {
        in_degree.insert(&task.name, task.depends_on.len());
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(&task.name);
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut batches = Vec::new();

    while !ready.is_empty() {
        let mut next = BTreeSet::new();
        for name in &ready {
            in_degree.remove(name);
            for dependent in dependents.get(name).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        next.insert(*dependent);
                    }
                }
            }
        }
        batches.push(std::mem::take(&mut ready));
        ready = next.into_iter().collect();
    }

    if !in_degree.is_empty() {
        return Err(GraphError::Cycle {
            nodes: in_degree.keys().map(|n| n.to_string()).collect(),
        });
    }
    Ok(batches)
}
