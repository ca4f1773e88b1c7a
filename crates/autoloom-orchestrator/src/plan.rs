//! Dry-run summary of what an intent would schedule.

use std::collections::{BTreeMap, HashMap};

use autoloom_core::types::{Job, TriggerSpec};
use serde::Serialize;

/// Task types that usually end up as long-lived background work.
const BACKGROUND_TYPES: &[&str] = &["data_scrape", "health_check", "monitor"];

/// Average minutes per step used for the total estimate.
const MINUTES_PER_STEP: usize = 3;

/// One resolved task as it would be scheduled.
#[derive(Debug, Clone, Serialize)]
pub struct PlanStep {
    pub name: String,
    pub task_type: String,
    /// Zero-based batch index; batch `n` only depends on batches before it.
    pub batch: usize,
    pub trigger: String,
    pub depends_on: Vec<String>,
    pub estimated_time: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub steps: Vec<PlanStep>,
    /// Task names per batch.
    pub batches: Vec<Vec<String>>,
    pub task_breakdown: BTreeMap<String, usize>,
    /// Steps with a cron or interval trigger.
    pub scheduled_jobs: usize,
    pub dependent_jobs: usize,
    pub background_tasks: usize,
    pub estimated_total_time: String,
    /// 0.0 to 10.0.
    pub complexity_score: f64,
    pub recommendations: Vec<String>,
}

impl PlanSummary {
    /// Summarise resolver output.
    pub fn from_batches(batches: &[Vec<Job>]) -> Self {
        let names: HashMap<&str, &str> = batches
            .iter()
            .flatten()
            .map(|job| (job.job_id.as_str(), job.name.as_str()))
            .collect();

        let mut steps = Vec::new();
        let mut task_breakdown = BTreeMap::new();
        for (index, batch) in batches.iter().enumerate() {
            for job in batch {
                *task_breakdown.entry(job.task_type.clone()).or_insert(0) += 1;
                steps.push(PlanStep {
                    name: job.name.clone(),
                    task_type: job.task_type.clone(),
                    batch: index,
                    trigger: job.trigger.to_string(),
                    depends_on: job
                        .depends_on
                        .iter()
                        .map(|id| names.get(id.as_str()).copied().unwrap_or(id.as_str()).to_string())
                        .collect(),
                    estimated_time: estimate_task_time(&job.task_type),
                });
            }
        }

        let jobs = || batches.iter().flatten();
        let scheduled_jobs = jobs()
            .filter(|j| matches!(j.trigger, TriggerSpec::Cron { .. } | TriggerSpec::Interval { .. }))
            .count();
        let dependent_jobs = jobs().filter(|j| !j.depends_on.is_empty()).count();
        let background_tasks = jobs()
            .filter(|j| BACKGROUND_TYPES.contains(&j.task_type.as_str()))
            .count();

        let complexity_score = complexity(steps.len(), scheduled_jobs, background_tasks);
        let recommendations = recommendations(
            steps.len(),
            scheduled_jobs,
            background_tasks,
            task_breakdown.get("account_create").copied().unwrap_or(0),
        );

        Self {
            estimated_total_time: total_time(steps.len()),
            batches: batches
                .iter()
                .map(|b| b.iter().map(|j| j.name.clone()).collect())
                .collect(),
            steps,
            task_breakdown,
            scheduled_jobs,
            dependent_jobs,
            background_tasks,
            complexity_score,
            recommendations,
        }
    }
}

/// Rough wall time for one run of a task type.
pub fn estimate_task_time(task_type: &str) -> &'static str {
    match task_type {
        "account_create" => "5-10 minutes",
        "browser_navigate" | "health_check" => "30 seconds",
        "data_scrape" => "2-5 minutes",
        "cleanup" => "1-2 minutes",
        _ => "1-3 minutes",
    }
}

fn total_time(steps: usize) -> String {
    let minutes = steps * MINUTES_PER_STEP;
    if minutes < 60 {
        format!("{minutes} minutes")
    } else {
        format!("{} hours {} minutes", minutes / 60, minutes % 60)
    }
}

fn complexity(steps: usize, scheduled: usize, background: usize) -> f64 {
    let score = steps as f64 * 0.1 + scheduled as f64 * 0.2 + background as f64 * 0.3;
    (score.min(10.0) * 10.0).round() / 10.0
}

fn recommendations(steps: usize, scheduled: usize, background: usize, accounts: usize) -> Vec<String> {
    let mut out = Vec::new();
    if steps > 10 {
        out.push("Consider breaking down into smaller batches".to_string());
    }
    if background > 5 {
        out.push("Monitor resource usage with multiple background processes".to_string());
    }
    if scheduled > 20 {
        out.push("Review job scheduling to avoid conflicts".to_string());
    }
    if accounts > 5 {
        out.push("Add delays between account creations to avoid rate limits".to_string());
    }
    if out.is_empty() {
        out.push("Plan looks good for execution".to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloom_core::types::Parameters;

    fn job(name: &str, task_type: &str, trigger: TriggerSpec, deps: &[&str]) -> Job {
        let mut job = Job::new(
            format!("wf/{name}"),
            name,
            task_type,
            Parameters::new(),
            trigger,
            3,
            300,
        );
        job.depends_on = deps.iter().map(|d| format!("wf/{d}")).collect();
        job
    }

    #[test]
    fn test_summary_of_small_plan() {
        let batches = vec![
            vec![job("signup", "account_create", TriggerSpec::cron("0 9 * * *"), &[])],
            vec![job("crawl", "data_scrape", TriggerSpec::OnDependencySatisfied, &["signup"])],
        ];
        let summary = PlanSummary::from_batches(&batches);

        assert_eq!(summary.batches, vec![vec!["signup"], vec!["crawl"]]);
        assert_eq!(summary.steps[1].depends_on, vec!["signup"]);
        assert_eq!(summary.steps[1].batch, 1);
        assert_eq!(summary.steps[0].estimated_time, "5-10 minutes");
        assert_eq!(summary.task_breakdown["account_create"], 1);
        assert_eq!(summary.scheduled_jobs, 1);
        assert_eq!(summary.dependent_jobs, 1);
        assert_eq!(summary.background_tasks, 1);
        assert_eq!(summary.estimated_total_time, "6 minutes");
        // 2*0.1 + 1*0.2 + 1*0.3
        assert_eq!(summary.complexity_score, 0.7);
        assert_eq!(summary.recommendations, vec!["Plan looks good for execution"]);
    }

    #[test]
    fn test_large_plan_recommendations() {
        let batch: Vec<Job> = (0..24)
            .map(|i| job(&format!("a{i}"), "account_create", TriggerSpec::interval(60), &[]))
            .collect();
        let summary = PlanSummary::from_batches(&[batch]);

        assert_eq!(summary.estimated_total_time, "1 hours 12 minutes");
        assert_eq!(summary.complexity_score, 7.2);
        assert_eq!(
            summary.recommendations,
            vec![
                "Consider breaking down into smaller batches",
                "Review job scheduling to avoid conflicts",
                "Add delays between account creations to avoid rate limits",
            ]
        );
    }

    #[test]
    fn test_complexity_capped() {
        assert_eq!(complexity(40, 30, 10), 10.0);
        assert_eq!(estimate_task_time("unknown"), "1-3 minutes");
    }
}
