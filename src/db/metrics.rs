//! In-process metrics sink: atomic counters and gauges sampled by the
//! background metric tick, rendered as Prometheus text on demand.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use sysinfo::System;

#[derive(Default)]
struct Gauges {
    cpu_cache_usage_percent: AtomicU64,
    gpu_cache_usage_percent: AtomicU64,
    data_file_size_bytes: AtomicU64,
    cpu_usage_percent: AtomicU64,
    ram_usage_percent: AtomicU64,
}

pub struct Metrics {
    pub keep_alive_total: AtomicU64,
    pub insert_total: AtomicU64,
    pub query_total: AtomicU64,
    pub merge_total: AtomicU64,
    pub index_build_total: AtomicU64,
    gauges: Gauges,
    system: Mutex<System>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            keep_alive_total: AtomicU64::new(0),
            insert_total: AtomicU64::new(0),
            query_total: AtomicU64::new(0),
            merge_total: AtomicU64::new(0),
            index_build_total: AtomicU64::new(0),
            gauges: Gauges::default(),
            system: Mutex::new(System::new()),
        }
    }

    pub fn keep_alive(&self, ticks: u64) {
        self.keep_alive_total.fetch_add(ticks, Ordering::Relaxed);
    }

    pub fn record_inserts(&self, n: u64) {
        self.insert_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_query(&self) {
        self.query_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_merge(&self) {
        self.merge_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_index_build(&self) {
        self.index_build_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_cache_usage_percent(&self, cpu: u64, gpu: u64) {
        self.gauges
            .cpu_cache_usage_percent
            .store(cpu, Ordering::Relaxed);
        self.gauges
            .gpu_cache_usage_percent
            .store(gpu, Ordering::Relaxed);
    }

    pub fn set_data_file_size(&self, bytes: u64) {
        self.gauges
            .data_file_size_bytes
            .store(bytes, Ordering::Relaxed);
    }

    /// Refresh CPU and RAM utilization gauges from the OS.
    pub fn sample_system(&self) {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        system.refresh_memory();
        let cpu = system.global_cpu_info().cpu_usage() as u64;
        let ram = if system.total_memory() > 0 {
            system.used_memory() * 100 / system.total_memory()
        } else {
            0
        };
        self.gauges
            .cpu_usage_percent
            .store(cpu.min(100), Ordering::Relaxed);
        self.gauges
            .ram_usage_percent
            .store(ram.min(100), Ordering::Relaxed);
    }

    /// Prometheus text exposition of every counter and gauge.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let counter = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!("# TYPE {name} counter\n{name} {value}\n"));
        };
        let gauge = |out: &mut String, name: &str, value: u64| {
            out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
        };

        counter(
            &mut out,
            "ostinato_keep_alive_total",
            self.keep_alive_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ostinato_insert_rows_total",
            self.insert_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ostinato_query_requests_total",
            self.query_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ostinato_merge_total",
            self.merge_total.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ostinato_index_build_total",
            self.index_build_total.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ostinato_cpu_cache_usage_percent",
            self.gauges.cpu_cache_usage_percent.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ostinato_gpu_cache_usage_percent",
            self.gauges.gpu_cache_usage_percent.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ostinato_data_file_size_bytes",
            self.gauges.data_file_size_bytes.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ostinato_cpu_usage_percent",
            self.gauges.cpu_usage_percent.load(Ordering::Relaxed),
        );
        gauge(
            &mut out,
            "ostinato_ram_usage_percent",
            self.gauges.ram_usage_percent.load(Ordering::Relaxed),
        );
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_counters_and_gauges() {
        let metrics = Metrics::new();
        metrics.keep_alive(3);
        metrics.record_inserts(10);
        metrics.set_data_file_size(4096);
        let text = metrics.render();
        assert!(text.contains("ostinato_keep_alive_total 3"));
        assert!(text.contains("ostinato_insert_rows_total 10"));
        assert!(text.contains("ostinato_data_file_size_bytes 4096"));
    }

    #[test]
    fn system_sampling_stays_within_bounds() {
        let metrics = Metrics::new();
        metrics.sample_system();
        let text = metrics.render();
        assert!(text.contains("ostinato_ram_usage_percent"));
    }
}
