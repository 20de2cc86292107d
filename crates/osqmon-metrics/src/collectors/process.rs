use std::{sync::Arc, time::Instant};

use osqmon_common::error::Result;

use crate::{
    fq_name,
    registry::{GaugeMetric, MetricsRegistry},
};

pub struct ProcessMetrics {
    start_time: Instant,
    uptime_seconds: Arc<GaugeMetric>,
    process_resident_memory_bytes: Arc<GaugeMetric>,
}

impl ProcessMetrics {
    pub fn register(registry: &MetricsRegistry) -> Result<Self> {
        Ok(Self {
            start_time: Instant::now(),
            uptime_seconds: registry.register_gauge(
                &fq_name("uptime_seconds"),
                "Exporter process uptime in seconds",
                &[],
            )?,
            process_resident_memory_bytes: registry.register_gauge(
                &fq_name("process_resident_memory_bytes"),
                "Resident memory size of the exporter process in bytes",
                &[],
            )?,
        })
    }

    pub fn refresh(&self) {
        self.uptime_seconds
            .set(&[], self.start_time.elapsed().as_secs_f64());

        if let Some(resident_bytes) = read_resident_memory_bytes() {
            self.process_resident_memory_bytes
                .set(&[], resident_bytes as f64);
        }
    }
}

#[cfg(target_os = "linux")]
fn read_resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb = rest
                .split_whitespace()
                .next()
                .and_then(|value| value.parse::<u64>().ok())?;
            return kb.checked_mul(1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn read_resident_memory_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use crate::registry::MetricsRegistry;

    use super::ProcessMetrics;

    #[test]
    fn refresh_publishes_uptime() {
        let registry = MetricsRegistry::new();
        let metrics = ProcessMetrics::register(&registry).unwrap();
        metrics.refresh();

        let rendered = registry.render_prometheus();
        assert!(rendered.contains("# TYPE osquery_exporter_uptime_seconds gauge\n"));
        assert!(rendered.contains("osquery_exporter_uptime_seconds "));
    }
}
