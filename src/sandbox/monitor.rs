use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sandbox::container::ContainerHandle;

/// Jiffies-to-microseconds factor for /proc/stat (USER_HZ = 100).
const USEC_PER_JIFFY: u64 = 10_000;

const SECTION_SEPARATOR: &str = "===";

/// One snapshot of a container's resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatsSample {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub memory_limit_bytes: u64,
    pub memory_percent: f64,
    pub network_rx_bytes: u64,
    pub network_tx_bytes: u64,
}

/// Raw counters read inside the container in one exec round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Counters {
    /// Cumulative container CPU time, microseconds (cgroup cpu.stat)
    cpu_usec: u64,
    /// Cumulative system-wide CPU time across all cores, microseconds
    system_usec: u64,
    online_cpus: u32,
    memory_bytes: u64,
    /// None when the cgroup reports no ceiling ("max")
    memory_limit_bytes: Option<u64>,
    rx_bytes: u64,
    tx_bytes: u64,
}

/// Samples a container's CPU/memory/network counters. CPU percent needs a
/// previous reading, so the first sample of a monitor reports 0%.
#[derive(Default)]
pub struct StatsMonitor {
    prev: Option<Counters>,
}

impl StatsMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read one snapshot. Returns `None` when the container is not running
    /// or its counters are unreadable.
    pub async fn sample_once(&mut self, container: &ContainerHandle) -> Option<StatsSample> {
        if !container.is_running().await {
            return None;
        }

        let script = concat!(
            "cat /sys/fs/cgroup/cpu.stat; echo ===; ",
            "cat /sys/fs/cgroup/memory.current; echo ===; ",
            "cat /sys/fs/cgroup/memory.max; echo ===; ",
            "head -n1 /proc/stat; echo ===; ",
            "nproc; echo ===; ",
            "cat /sys/class/net/eth0/statistics/rx_bytes /sys/class/net/eth0/statistics/tx_bytes 2>/dev/null || true"
        );

        let result = match container.exec_sh(script).await {
            Ok(result) if result.exit_code == 0 => result,
            Ok(result) => {
                debug!(exit_code = result.exit_code, "Stats read failed");
                return None;
            }
            Err(e) => {
                debug!(error = %e, "Stats read failed");
                return None;
            }
        };

        let counters = parse_counters(&result.stdout)?;
        let sample = build_sample(self.prev.as_ref(), &counters);
        self.prev = Some(counters);
        Some(sample)
    }
}

/// Parse the concatenated counter sections produced by the sampling script.
fn parse_counters(text: &str) -> Option<Counters> {
    let sections: Vec<&str> = text.split(SECTION_SEPARATOR).collect();
    if sections.len() < 5 {
        return None;
    }

    // cpu.stat: "usage_usec N" among other lines
    let cpu_usec = sections[0]
        .lines()
        .find_map(|line| line.strip_prefix("usage_usec "))
        .and_then(|v| v.trim().parse::<u64>().ok())?;

    let memory_bytes = sections[1].trim().parse::<u64>().ok()?;

    let memory_limit_bytes = match sections[2].trim() {
        "max" => None,
        value => Some(value.parse::<u64>().ok()?),
    };

    // "cpu  user nice system idle ..." in jiffies, aggregated over all cores
    let total_jiffies: u64 = sections[3]
        .trim()
        .strip_prefix("cpu")?
        .split_whitespace()
        .filter_map(|v| v.parse::<u64>().ok())
        .sum();

    let online_cpus = sections[4].trim().parse::<u32>().ok()?;

    // Network counters are absent when networking is disabled
    let (rx_bytes, tx_bytes) = sections
        .get(5)
        .map(|s| {
            let mut values = s.split_whitespace().filter_map(|v| v.parse::<u64>().ok());
            (values.next().unwrap_or(0), values.next().unwrap_or(0))
        })
        .unwrap_or((0, 0));

    Some(Counters {
        cpu_usec,
        system_usec: total_jiffies * USEC_PER_JIFFY,
        online_cpus,
        memory_bytes,
        memory_limit_bytes,
        rx_bytes,
        tx_bytes,
    })
}

/// CPU percentage via the delta-over-delta formula: container CPU time
/// divided by system-wide CPU time since the previous reading, scaled by
/// the active core count.
fn cpu_percent(prev: &Counters, cur: &Counters) -> f64 {
    let cpu_delta = cur.cpu_usec.saturating_sub(prev.cpu_usec);
    let system_delta = cur.system_usec.saturating_sub(prev.system_usec);

    if system_delta > 0 && cpu_delta > 0 {
        (cpu_delta as f64 / system_delta as f64) * cur.online_cpus as f64 * 100.0
    } else {
        0.0
    }
}

fn build_sample(prev: Option<&Counters>, cur: &Counters) -> StatsSample {
    let limit = cur.memory_limit_bytes.unwrap_or(0);
    StatsSample {
        cpu_percent: prev.map(|p| cpu_percent(p, cur)).unwrap_or(0.0),
        memory_bytes: cur.memory_bytes,
        memory_limit_bytes: limit,
        memory_percent: if limit > 0 {
            cur.memory_bytes as f64 / limit as f64 * 100.0
        } else {
            0.0
        },
        network_rx_bytes: cur.rx_bytes,
        network_tx_bytes: cur.tx_bytes,
    }
}

/// Running maxima over the samples of one run. Folding is monotone: peaks
/// never decrease while sampling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PeakStats {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

impl PeakStats {
    pub fn fold(&mut self, sample: &StatsSample) {
        self.cpu_percent = self.cpu_percent.max(sample.cpu_percent);
        self.memory_bytes = self.memory_bytes.max(sample.memory_bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_text(usage_usec: u64, mem: u64, jiffies: u64) -> String {
        format!(
            "usage_usec {}\nuser_usec 100\nsystem_usec 50\n===\n{}\n===\n1073741824\n===\ncpu  {} 0 0 0 0 0 0 0 0 0\n===\n4\n===\n1000\n2000\n",
            usage_usec, mem, jiffies
        )
    }

    #[test]
    fn test_parse_counters() {
        let counters = parse_counters(&sample_text(5000, 1024, 200)).unwrap();
        assert_eq!(counters.cpu_usec, 5000);
        assert_eq!(counters.memory_bytes, 1024);
        assert_eq!(counters.memory_limit_bytes, Some(1073741824));
        assert_eq!(counters.system_usec, 200 * USEC_PER_JIFFY);
        assert_eq!(counters.online_cpus, 4);
        assert_eq!(counters.rx_bytes, 1000);
        assert_eq!(counters.tx_bytes, 2000);
    }

    #[test]
    fn test_parse_unlimited_memory() {
        let text = "usage_usec 1\n===\n10\n===\nmax\n===\ncpu  1 1 1 1\n===\n2\n===\n0\n0\n";
        let counters = parse_counters(text).unwrap();
        assert_eq!(counters.memory_limit_bytes, None);
        let sample = build_sample(None, &counters);
        assert_eq!(sample.memory_percent, 0.0);
    }

    #[test]
    fn test_parse_garbage_returns_none() {
        assert!(parse_counters("").is_none());
        assert!(parse_counters("no sections here").is_none());
    }

    #[test]
    fn test_cpu_percent_delta_over_delta() {
        let prev = parse_counters(&sample_text(0, 0, 0)).unwrap();
        // Container burned 1 core-second while the 4-core system advanced
        // 1 wall second: 100 jiffies/core * 4 cores = 400 jiffies.
        let cur = parse_counters(&sample_text(1_000_000, 0, 400)).unwrap();
        let pct = cpu_percent(&prev, &cur);
        assert!((pct - 100.0).abs() < 1e-6, "expected 100%, got {}", pct);
    }

    #[test]
    fn test_cpu_percent_zero_without_progress() {
        let prev = parse_counters(&sample_text(500, 0, 100)).unwrap();
        assert_eq!(cpu_percent(&prev, &prev), 0.0);
    }

    #[test]
    fn test_first_sample_reports_zero_cpu() {
        let cur = parse_counters(&sample_text(5000, 2048, 300)).unwrap();
        let sample = build_sample(None, &cur);
        assert_eq!(sample.cpu_percent, 0.0);
        assert_eq!(sample.memory_bytes, 2048);
    }

    #[test]
    fn test_memory_percent() {
        let text = "usage_usec 1\n===\n536870912\n===\n1073741824\n===\ncpu  1 1 1 1\n===\n2\n===\n0\n0\n";
        let counters = parse_counters(text).unwrap();
        let sample = build_sample(None, &counters);
        assert!((sample.memory_percent - 50.0).abs() < 1e-6);
    }

    #[test]
    fn test_peaks_are_monotone() {
        let mut peaks = PeakStats::default();
        let mut sample = StatsSample {
            cpu_percent: 10.0,
            memory_bytes: 100,
            memory_limit_bytes: 1000,
            memory_percent: 10.0,
            network_rx_bytes: 0,
            network_tx_bytes: 0,
        };
        peaks.fold(&sample);
        assert_eq!(peaks.cpu_percent, 10.0);
        assert_eq!(peaks.memory_bytes, 100);

        sample.cpu_percent = 50.0;
        sample.memory_bytes = 80;
        peaks.fold(&sample);
        assert_eq!(peaks.cpu_percent, 50.0);
        // Memory peak does not decrease
        assert_eq!(peaks.memory_bytes, 100);

        sample.cpu_percent = 5.0;
        peaks.fold(&sample);
        assert_eq!(peaks.cpu_percent, 50.0);
    }
}
