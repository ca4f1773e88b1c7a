//! Best-effort CPU/memory sampling from `/proc`.
//!
//! Anything unreadable (non-Linux host, process gone, permissions) yields
//! `None` for that value. Sampling never fails a lifecycle transition.

use std::time::Instant;

use autoloom_core::types::ResourceSample;
use chrono::{DateTime, Utc};

/// Kernel clock ticks per second; 100 on every mainstream Linux build.
const CLOCK_TICKS_PER_SEC: f64 = 100.0;

/// CPU time seen at the previous sample, for computing a rate.
#[derive(Debug, Clone, Copy)]
pub struct CpuMark {
    ticks: u64,
    at: Instant,
}

/// Sample `pid`. Returns the sample and the mark for the next call.
pub fn sample(
    pid: Option<u32>,
    previous: Option<CpuMark>,
    now: DateTime<Utc>,
) -> (ResourceSample, Option<CpuMark>) {
    let Some(pid) = pid else {
        return (empty(now), None);
    };

    let mark = cpu_ticks(pid).map(|ticks| CpuMark {
        ticks,
        at: Instant::now(),
    });
    let cpu_percent = match (previous, mark) {
        (Some(prev), Some(cur)) => {
            let elapsed = cur.at.duration_since(prev.at).as_secs_f64();
            (elapsed > 0.0).then(|| {
                let used = cur.ticks.saturating_sub(prev.ticks) as f64 / CLOCK_TICKS_PER_SEC;
                (used / elapsed * 100.0 * 10.0).round() / 10.0
            })
        }
        _ => None,
    };

    let sample = ResourceSample {
        sampled_at: now,
        cpu_percent,
        memory_mb: resident_mb(pid),
    };
    (sample, mark)
}

/// A sample with nothing in it, recorded when no pid is available.
pub fn empty(now: DateTime<Utc>) -> ResourceSample {
    ResourceSample {
        sampled_at: now,
        cpu_percent: None,
        memory_mb: None,
    }
}

/// utime + stime from `/proc/<pid>/stat`.
fn cpu_ticks(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat_ticks(&stat)
}

fn parse_stat_ticks(stat: &str) -> Option<u64> {
    // comm (field 2) may contain spaces; count fields after its closing paren
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // rest starts at field 3 (state); utime/stime are fields 14/15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// VmRSS from `/proc/<pid>/status`, in MB.
fn resident_mb(pid: u32) -> Option<f64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_vm_rss_mb(&status)
}

fn parse_vm_rss_mb(status: &str) -> Option<f64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: f64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some((kb / 1024.0 * 10.0).round() / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stat_with_spaces_in_comm() {
        let stat = "4242 (my worker) S 1 4242 4242 0 -1 4194560 500 0 0 0 150 50 0 0 20 0 1 0 100 1000 200";
        assert_eq!(parse_stat_ticks(stat), Some(200));
        assert_eq!(parse_stat_ticks("garbage"), None);
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tpython\nVmPeak:\t  20000 kB\nVmRSS:\t   51200 kB\n";
        assert_eq!(parse_vm_rss_mb(status), Some(50.0));
        assert_eq!(parse_vm_rss_mb("Name:\tx\n"), None);
    }

    #[test]
    fn test_missing_pid_records_empty_sample() {
        let now = Utc::now();
        let (sample, mark) = sample(None, None, now);
        assert_eq!(sample, empty(now));
        assert!(mark.is_none());
    }

    #[test]
    fn test_vanished_process_is_not_an_error() {
        let (sample, _) = sample(Some(u32::MAX - 1), None, Utc::now());
        assert!(sample.cpu_percent.is_none());
        assert!(sample.memory_mb.is_none());
    }
}
