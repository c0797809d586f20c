use chrono::Utc;
use serde::Serialize;
use sysinfo::System;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Status payload pushed on every poll cycle. Field names are the wire
/// contract with the controller's host row.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub hostname: String,
    pub agent_version: &'static str,
    pub timestamp: String,
    pub cpu_percent: f64,
    pub cpu_count: i64,
    pub ram_total_mb: f64,
    pub ram_used_mb: f64,
    pub ram_percent: f64,
    pub uptime_seconds: i64,
    pub os_name: Option<String>,
    pub kernel: Option<String>,
    pub arch: Option<String>,
}

/// Keeps one sysinfo handle alive across poll cycles so CPU usage deltas are
/// measured against the previous refresh rather than process start.
pub struct Collector {
    system: System,
}

impl Collector {
    pub fn new() -> Self {
        // Prime the CPU counters so the first report is not zero.
        let mut system = System::new();
        system.refresh_cpu();
        Self { system }
    }

    pub fn collect(&mut self, hostname: &str) -> StatusReport {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total_mb = self.system.total_memory() as f64 / (1024.0 * 1024.0);
        let used_mb = self.system.used_memory() as f64 / (1024.0 * 1024.0);
        let ram_percent = if total_mb > 0.0 {
            used_mb / total_mb * 100.0
        } else {
            0.0
        };

        StatusReport {
            hostname: hostname.to_string(),
            agent_version: AGENT_VERSION,
            timestamp: Utc::now().to_rfc3339(),
            cpu_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            cpu_count: self.system.cpus().len() as i64,
            ram_total_mb: round2(total_mb),
            ram_used_mb: round2(used_mb),
            ram_percent: round2(ram_percent),
            uptime_seconds: System::uptime() as i64,
            os_name: System::long_os_version().or_else(System::name),
            kernel: System::kernel_version(),
            arch: System::cpu_arch(),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_populates_core_fields() {
        let mut collector = Collector::new();
        let report = collector.collect("web-01");
        assert_eq!(report.hostname, "web-01");
        assert_eq!(report.agent_version, AGENT_VERSION);
        assert!(report.cpu_count >= 1);
        assert!(report.ram_total_mb > 0.0);
        assert!(report.ram_percent >= 0.0 && report.ram_percent <= 100.0);
    }
}
