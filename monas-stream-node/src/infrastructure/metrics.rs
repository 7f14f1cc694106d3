//! Metrics context handed to each component at construction.
//!
//! There is no process-global registry: a node owns one [`MetricsContext`],
//! components create their own named [`Metrics`] group from it, and the whole
//! context can be exported as a [`MetricsReport`] snapshot.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RecordedMetric {
    pub total: f64,
    pub count: u64,
    pub last: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsGroupReport {
    pub recorded: BTreeMap<String, RecordedMetric>,
    pub fixed: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsReport {
    pub groups: BTreeMap<String, MetricsGroupReport>,
}

impl MetricsReport {
    pub fn recorded(&self, group: &str, metric: &str) -> Option<RecordedMetric> {
        self.groups.get(group)?.recorded.get(metric).copied()
    }

    pub fn fixed(&self, group: &str, metric: &str) -> Option<f64> {
        self.groups.get(group)?.fixed.get(metric).copied()
    }
}

/// A named group of counters and gauges.
#[derive(Debug, Default)]
pub struct Metrics {
    name: String,
    state: Mutex<MetricsGroupReport>,
}

impl Metrics {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Accumulates a sample into a recorded metric.
    pub fn record(&self, metric: &str, value: f64) {
        let mut state = self.state.lock();
        let entry = state.recorded.entry(metric.to_string()).or_default();
        entry.total += value;
        entry.count += 1;
        entry.last = value;
    }

    /// Sets a fixed gauge to an absolute value.
    pub fn set(&self, metric: &str, value: f64) {
        self.state.lock().fixed.insert(metric.to_string(), value);
    }

    pub fn count(&self, metric: &str) -> u64 {
        self.state
            .lock()
            .recorded
            .get(metric)
            .map(|m| m.count)
            .unwrap_or(0)
    }

    pub fn fixed(&self, metric: &str) -> Option<f64> {
        self.state.lock().fixed.get(metric).copied()
    }

    fn snapshot(&self) -> MetricsGroupReport {
        self.state.lock().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsContext {
    groups: Arc<Mutex<BTreeMap<String, Arc<Metrics>>>>,
}

impl MetricsContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the group with this name, creating it on first use.
    pub fn create(&self, name: &str) -> Arc<Metrics> {
        self.groups
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Metrics {
                    name: name.to_string(),
                    state: Mutex::new(MetricsGroupReport::default()),
                })
            })
            .clone()
    }

    pub fn report(&self) -> MetricsReport {
        let groups = self.groups.lock();
        MetricsReport {
            groups: groups
                .iter()
                .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
                .collect(),
        }
    }
}
