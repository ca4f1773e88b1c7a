//! Append-only execution history, capped per job in memory.

use std::collections::{HashMap, VecDeque};

use autoloom_core::types::ExecutionRecord;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

pub struct ExecutionHistory {
    records: RwLock<HashMap<String, VecDeque<ExecutionRecord>>>,
    limit: usize,
}

impl ExecutionHistory {
    /// Keep at most `limit` records per job (at least one).
    pub fn new(limit: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            limit: limit.max(1),
        }
    }

    pub async fn append(&self, record: ExecutionRecord) {
        let mut records = self.records.write().await;
        let log = records.entry(record.job_id.clone()).or_default();
        log.push_back(record);
        while log.len() > self.limit {
            log.pop_front();
        }
    }

    /// Most recent record of a job.
    pub async fn latest(&self, job_id: &str) -> Option<ExecutionRecord> {
        self.records
            .read()
            .await
            .get(job_id)
            .and_then(|log| log.back().cloned())
    }

    /// Records of a job started within `[from, to]`, oldest first.
    pub async fn for_job(
        &self,
        job_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .await
            .get(job_id)
            .map(|log| {
                log.iter()
                    .filter(|r| from.is_none_or(|f| r.started_at >= f))
                    .filter(|r| to.is_none_or(|t| r.started_at <= t))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn remove_job(&self, job_id: &str) {
        self.records.write().await.remove(job_id);
    }

    pub async fn total(&self) -> usize {
        self.records.read().await.values().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoloom_core::types::ExecutionOutcome;
    use chrono::{Duration, TimeZone};

    fn record(job_id: &str, secs: i64) -> ExecutionRecord {
        let at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs);
        ExecutionRecord {
            record_id: format!("{job_id}-{secs}"),
            job_id: job_id.into(),
            attempt_number: 1,
            started_at: at,
            finished_at: at,
            outcome: ExecutionOutcome::Success {
                output: serde_json::Value::Null,
            },
            manual: false,
        }
    }

    #[tokio::test]
    async fn test_cap_drops_oldest() {
        let history = ExecutionHistory::new(3);
        for s in 0..5 {
            history.append(record("a", s)).await;
        }
        let all = history.for_job("a", None, None).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].record_id, "a-2");
        assert_eq!(history.latest("a").await.unwrap().record_id, "a-4");
    }

    #[tokio::test]
    async fn test_range_query() {
        let history = ExecutionHistory::new(100);
        for s in [0, 60, 120, 180] {
            history.append(record("a", s)).await;
        }
        history.append(record("b", 60)).await;
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let window = history
            .for_job("a", Some(base + Duration::seconds(60)), Some(base + Duration::seconds(120)))
            .await;
        assert_eq!(window.len(), 2);
        assert!(history.for_job("missing", None, None).await.is_empty());
        assert_eq!(history.total().await, 5);
    }
}
