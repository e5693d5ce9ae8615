//! Periodic metric sampling into the local store.

use std::sync::Arc;
use std::time::Duration;

use metric_types::Sample;
use rand::Rng;
use storage::Store;
use sysinfo::Pid;
use sysinfo::ProcessesToUpdate;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

pub const POLL_COUNT: &str = "PollCount";
pub const RANDOM_VALUE: &str = "RandomValue";

/// Something that can be sampled for gauges.
pub trait MetricSource: Send {
    fn sample(&mut self) -> Vec<Sample>;
}

/// Host memory, swap and CPU readings plus the agent's own process usage.
pub struct HostSource {
    system: System,
    pid: Option<Pid>,
    collect_cpu: bool,
}

impl HostSource {
    pub fn new(collect_cpu: bool) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!("process metrics disabled: {e}");
                None
            }
        };
        Self {
            system: System::new(),
            pid,
            collect_cpu,
        }
    }

    fn process_samples(&mut self, samples: &mut Vec<Sample>) {
        let Some(pid) = self.pid else {
            return;
        };
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let Some(process) = self.system.process(pid) else {
            return;
        };
        let disk = process.disk_usage();
        samples.extend([
            Sample::gauge("ProcessResidentMemory", process.memory() as f64),
            Sample::gauge("ProcessVirtualMemory", process.virtual_memory() as f64),
            Sample::gauge("ProcessCpuUsage", f64::from(process.cpu_usage())),
            Sample::gauge("ProcessDiskReadBytes", disk.total_read_bytes as f64),
            Sample::gauge("ProcessDiskWrittenBytes", disk.total_written_bytes as f64),
            Sample::gauge("ProcessRunTime", process.run_time() as f64),
        ]);
    }
}

impl MetricSource for HostSource {
    fn sample(&mut self) -> Vec<Sample> {
        self.system.refresh_memory();
        let mut samples = vec![
            Sample::gauge("TotalMemory", self.system.total_memory() as f64),
            Sample::gauge("FreeMemory", self.system.free_memory() as f64),
            Sample::gauge("UsedMemory", self.system.used_memory() as f64),
            Sample::gauge("AvailableMemory", self.system.available_memory() as f64),
            Sample::gauge("TotalSwap", self.system.total_swap() as f64),
            Sample::gauge("UsedSwap", self.system.used_swap() as f64),
        ];

        self.process_samples(&mut samples);

        if self.collect_cpu {
            self.system.refresh_cpu_usage();
            samples.extend(self.system.cpus().iter().enumerate().map(|(i, cpu)| {
                Sample::gauge(format!("CPUutilization{}", i + 1), f64::from(cpu.cpu_usage()))
            }));
        }
        samples
    }
}

/// Polls sources every `interval` and accumulates their readings in `store`.
pub struct Collector {
    store: Arc<dyn Store>,
    sources: Vec<Box<dyn MetricSource>>,
    interval: Duration,
}

impl Collector {
    pub fn new(store: Arc<dyn Store>, interval: Duration) -> Self {
        Self {
            store,
            sources: Vec::new(),
            interval,
        }
    }

    pub fn with_source(mut self, source: impl MetricSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Take one round of samples.
    pub async fn poll(&mut self) {
        let mut samples = vec![
            Sample::counter(POLL_COUNT, 1),
            Sample::gauge(RANDOM_VALUE, rand::rng().random::<f64>()),
        ];
        for source in &mut self.sources {
            samples.extend(source.sample());
        }

        let total = samples.len();
        for Sample { name, value } in samples {
            if let Err(e) = self.store.add(&name, value).await {
                warn!(metric = %name, "failed to record sample: {e:?}");
            }
        }
        debug!(samples = total, "metrics polled");
    }

    pub async fn run(mut self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("collector shutdown requested");
                    break;
                }
                _ = ticker.tick() => self.poll().await,
            }
        }
    }
}

/// A source that always reports the same samples.
pub struct StaticSource(pub Vec<Sample>);

impl MetricSource for StaticSource {
    fn sample(&mut self) -> Vec<Sample> {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use metric_types::ValueMetric;
    use similar_asserts::assert_eq;
    use storage::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn poll_counts_and_stores_source_readings() {
        let store = Arc::new(MemoryStore::new());
        let mut collector = Collector::new(store.clone(), Duration::from_secs(2))
            .with_source(StaticSource(vec![Sample::gauge("Alloc", 42.0)]));

        collector.poll().await;
        collector.poll().await;

        assert_eq!(
            store.get(POLL_COUNT).await.expect("should exist"),
            ValueMetric::Counter(2)
        );
        assert_eq!(
            store.get("Alloc").await.expect("should exist"),
            ValueMetric::Gauge(42.0)
        );
        let random = store.get(RANDOM_VALUE).await.expect("should exist");
        assert!(matches!(random, ValueMetric::Gauge(v) if (0.0..1.0).contains(&v)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_polls_every_interval_until_cancelled() {
        let store = Arc::new(MemoryStore::new());
        let collector = Collector::new(store.clone(), Duration::from_secs(2));
        let token = CancellationToken::new();

        let handle = tokio::spawn(collector.run(token.clone()));
        // ticks at 0s, 2s and 4s
        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();
        handle.await.expect("collector should stop");

        assert_eq!(
            store.get(POLL_COUNT).await.expect("should exist"),
            ValueMetric::Counter(3)
        );
    }

    #[tokio::test]
    async fn kind_conflicts_are_logged_not_fatal() {
        let store = Arc::new(MemoryStore::new());
        store
            .add(POLL_COUNT, ValueMetric::Gauge(0.0))
            .await
            .expect("should seed conflicting kind");
        let mut collector = Collector::new(store.clone(), Duration::from_secs(2))
            .with_source(StaticSource(vec![Sample::gauge("Alloc", 1.0)]));

        collector.poll().await;

        assert_eq!(
            store.get("Alloc").await.expect("should exist"),
            ValueMetric::Gauge(1.0)
        );
    }

    #[test]
    fn host_source_reports_memory_gauges() {
        let mut source = HostSource::new(false);
        let names: Vec<String> = source.sample().into_iter().map(|s| s.name).collect();

        assert!(names.iter().any(|n| n == "TotalMemory"));
        assert!(names.iter().any(|n| n == "UsedSwap"));
        assert!(!names.iter().any(|n| n.starts_with("CPUutilization")));
    }
}
