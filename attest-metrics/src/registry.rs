use std::{
    collections::BTreeMap,
    fmt::Write,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

/// A named monotonic counter. Cheap to clone and to bump from any
/// worker; the registry aggregates across the whole process, standing
/// in for the prefork child-communication channel.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    pub fn incr(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
struct StageTimer {
    count: AtomicU64,
    total_micros: AtomicU64,
}

/// Process-wide registry of counters and per-stage latency
/// accumulators.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Counter>>,
    stages: RwLock<BTreeMap<String, Arc<StageTimer>>>,
}

impl MetricsRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (declaring on first use) the counter called `name`.
    pub fn counter(&self, name: &str) -> Counter {
        if let Some(counter) = self.counters.read().unwrap().get(name) {
            return counter.clone();
        }

        self.counters
            .write()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Record one dispatch of `stage` taking `elapsed`.
    pub fn record_stage(&self, stage: &str, elapsed: Duration) {
        let timer = {
            if let Some(timer) = self.stages.read().unwrap().get(stage) {
                Arc::clone(timer)
            } else {
                Arc::clone(
                    self.stages
                        .write()
                        .unwrap()
                        .entry(stage.to_string())
                        .or_default(),
                )
            }
        };

        timer.count.fetch_add(1, Ordering::Relaxed);
        timer
            .total_micros
            .fetch_add(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    /// Render the Prometheus text exposition. Deterministic: names are
    /// emitted in sorted order.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        for (name, counter) in self.counters.read().unwrap().iter() {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {}", counter.get());
        }

        for (stage, timer) in self.stages.read().unwrap().iter() {
            let count = timer.count.load(Ordering::Relaxed);
            let micros = timer.total_micros.load(Ordering::Relaxed);
            let _ = writeln!(out, "# TYPE stage_duration_seconds summary");
            let _ = writeln!(
                out,
                "stage_duration_seconds_sum{{stage=\"{stage}\"}} {:.6}",
                micros as f64 / 1_000_000.0
            );
            let _ = writeln!(out, "stage_duration_seconds_count{{stage=\"{stage}\"}} {count}");
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn counters_accumulate_and_share() {
        let registry = MetricsRegistry::new();
        let a = registry.counter("messages_total");
        let b = registry.counter("messages_total");

        a.incr();
        b.add(2);

        assert_eq!(registry.counter("messages_total").get(), 3);
    }

    #[test]
    fn render_is_sorted_and_stable() {
        let registry = MetricsRegistry::new();
        registry.counter("zeta_total").incr();
        registry.counter("alpha_total").add(5);

        let text = registry.render();
        let alpha = text.find("alpha_total 5").unwrap();
        let zeta = text.find("zeta_total 1").unwrap();
        assert!(alpha < zeta);
        assert_eq!(text, registry.render());
    }

    #[test]
    fn stage_timers_track_sum_and_count() {
        let registry = MetricsRegistry::new();
        registry.record_stage("eom", Duration::from_millis(2));
        registry.record_stage("eom", Duration::from_millis(3));

        let text = registry.render();
        assert!(text.contains("stage_duration_seconds_count{stage=\"eom\"} 2"));
        assert!(text.contains("stage_duration_seconds_sum{stage=\"eom\"} 0.005000"));
    }
}
