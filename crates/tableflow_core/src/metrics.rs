//! Sampling metrics collection for counters, gauges, histograms and timers.

use crate::current_timestamp_ms;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

/// Kind of a recorded metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Timer,
}

/// A single buffered observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub metric_type: MetricType,
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Probability in `[0, 1]` that a sample is kept
    pub sample_rate: f64,
    pub flush_interval: Duration,
    /// Retained samples per metric name; the oldest are dropped first
    pub max_samples_per_metric: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            sample_rate: 1.0,
            flush_interval: Duration::from_secs(60),
            max_samples_per_metric: 1000,
        }
    }
}

/// Handle for a running timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(Uuid);

/// Aggregate over the currently buffered samples of one metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Default)]
struct MetricsState {
    counters: HashMap<String, f64>,
    gauges: HashMap<String, f64>,
    samples: HashMap<String, VecDeque<MetricSample>>,
    timers: HashMap<TimerHandle, (String, Instant)>,
    subscribers: Vec<mpsc::UnboundedSender<Vec<MetricSample>>>,
    total_recorded: u64,
    total_flushed: u64,
}

struct MetricsInner {
    config: MetricsConfig,
    state: Mutex<MetricsState>,
    started: Instant,
}

impl MetricsInner {
    fn sampled(&self) -> bool {
        let rate = self.config.sample_rate;
        if rate >= 1.0 {
            true
        } else if rate <= 0.0 {
            false
        } else {
            rand::random::<f64>() < rate
        }
    }

    fn push(&self, state: &mut MetricsState, sample: MetricSample) {
        let buffer = state.samples.entry(sample.name.clone()).or_default();
        if self.config.max_samples_per_metric > 0
            && buffer.len() >= self.config.max_samples_per_metric
        {
            buffer.pop_front();
        }
        buffer.push_back(sample);
        state.total_recorded += 1;
    }

    fn record(
        &self,
        metric_type: MetricType,
        name: &str,
        value: f64,
        tags: BTreeMap<String, String>,
    ) {
        if !self.sampled() {
            return;
        }

        let mut state = self.state.lock();
        match metric_type {
            MetricType::Counter => {
                *state.counters.entry(name.to_string()).or_insert(0.0) += value;
            }
            MetricType::Gauge => {
                state.gauges.insert(name.to_string(), value);
            }
            MetricType::Histogram | MetricType::Timer => {}
        }

        let sample = MetricSample {
            metric_type,
            name: name.to_string(),
            value,
            tags,
            timestamp: current_timestamp_ms(),
        };
        self.push(&mut state, sample);
    }

    fn flush(&self) -> Vec<MetricSample> {
        let mut state = self.state.lock();
        let mut batch: Vec<MetricSample> = state
            .samples
            .drain()
            .flat_map(|(_, samples)| samples.into_iter())
            .collect();
        batch.sort_by_key(|sample| sample.timestamp);
        state.total_flushed += batch.len() as u64;

        if !batch.is_empty() {
            state
                .subscribers
                .retain(|subscriber| subscriber.send(batch.clone()).is_ok());
        }
        batch
    }
}

/// Collects metric samples and periodically hands them to subscribers.
pub struct MetricsManager {
    inner: Arc<MetricsInner>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetricsManager {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                config,
                state: Mutex::new(MetricsState::default()),
                started: Instant::now(),
            }),
            flush_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.inner.config
    }

    /// General form of every recording call.
    pub fn record(
        &self,
        metric_type: MetricType,
        name: &str,
        value: f64,
        tags: BTreeMap<String, String>,
    ) {
        self.inner.record(metric_type, name, value, tags);
    }

    pub fn increment(&self, name: &str) {
        self.increment_by(name, 1.0);
    }

    pub fn increment_by(&self, name: &str, value: f64) {
        self.record(MetricType::Counter, name, value, BTreeMap::new());
    }

    pub fn decrement(&self, name: &str) {
        self.decrement_by(name, 1.0);
    }

    pub fn decrement_by(&self, name: &str, value: f64) {
        self.record(MetricType::Counter, name, -value, BTreeMap::new());
    }

    pub fn gauge(&self, name: &str, value: f64) {
        self.record(MetricType::Gauge, name, value, BTreeMap::new());
    }

    pub fn histogram(&self, name: &str, value: f64) {
        self.record(MetricType::Histogram, name, value, BTreeMap::new());
    }

    pub fn start_timer(&self, name: &str) -> TimerHandle {
        let handle = TimerHandle(Uuid::new_v4());
        self.inner
            .state
            .lock()
            .timers
            .insert(handle, (name.to_string(), Instant::now()));
        handle
    }

    /// Stops a timer and records its duration in milliseconds. Unknown or
    /// already stopped handles return `None` and record nothing.
    pub fn stop_timer(&self, handle: TimerHandle) -> Option<Duration> {
        let (name, started) = self.inner.state.lock().timers.remove(&handle)?;
        let elapsed = started.elapsed();
        self.record(
            MetricType::Timer,
            &name,
            elapsed.as_secs_f64() * 1000.0,
            BTreeMap::new(),
        );
        Some(elapsed)
    }

    /// Times `future` under `name` and returns its output unchanged.
    ///
    /// The timer is stopped from a drop guard, so a sample is recorded whether
    /// the future completes, fails, panics or is cancelled.
    pub async fn measure<F>(&self, name: &str, future: F) -> F::Output
    where
        F: Future,
    {
        let _guard = TimerGuard {
            metrics: self,
            handle: self.start_timer(name),
        };
        future.await
    }

    /// Current accumulated counter value.
    pub fn counter(&self, name: &str) -> f64 {
        self.inner
            .state
            .lock()
            .counters
            .get(name)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn gauge_value(&self, name: &str) -> Option<f64> {
        self.inner.state.lock().gauges.get(name).copied()
    }

    /// Samples buffered since the last flush, oldest first.
    pub fn samples(&self, name: &str) -> Vec<MetricSample> {
        self.inner
            .state
            .lock()
            .samples
            .get(name)
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self, name: &str) -> Option<MetricSummary> {
        let state = self.inner.state.lock();
        let samples = state.samples.get(name)?;
        if samples.is_empty() {
            return None;
        }

        let count = samples.len();
        let (min, max, sum) = samples.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), sample| (min.min(sample.value), max.max(sample.value), sum + sample.value),
        );
        Some(MetricSummary {
            count,
            min,
            max,
            mean: sum / count as f64,
        })
    }

    /// Receives every non-empty batch produced by `flush`.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<MetricSample>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.state.lock().subscribers.push(tx);
        rx
    }

    /// Drains every buffered sample and sends the batch to subscribers.
    pub fn flush(&self) -> Vec<MetricSample> {
        let batch = self.inner.flush();
        debug!(samples = batch.len(), "Flushed metrics");
        batch
    }

    /// Runs `flush` every `flush_interval` until stopped or dropped.
    pub fn start_flush_task(&self) {
        let weak: Weak<MetricsInner> = Arc::downgrade(&self.inner);
        // tokio rejects a zero period
        let interval = self.inner.config.flush_interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let batch = inner.flush();
                trace!(samples = batch.len(), "Periodic metrics flush");
            }
        });

        if let Some(previous) = self.flush_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stop_flush_task(&self) -> bool {
        match self.flush_task.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Human readable summary of the buffered metrics.
    pub fn performance_report(&self) -> String {
        let state = self.inner.state.lock();

        let mut counters: Vec<_> = state.counters.iter().collect();
        counters.sort_by(|a, b| a.0.cmp(b.0));
        let counter_lines = counters
            .iter()
            .map(|(name, value)| format!("  {}: {}", name, value))
            .collect::<Vec<_>>()
            .join("\n");

        let mut gauges: Vec<_> = state.gauges.iter().collect();
        gauges.sort_by(|a, b| a.0.cmp(b.0));
        let gauge_lines = gauges
            .iter()
            .map(|(name, value)| format!("  {}: {}", name, value))
            .collect::<Vec<_>>()
            .join("\n");

        let mut timers: Vec<_> = state
            .samples
            .iter()
            .filter(|(_, samples)| {
                samples
                    .front()
                    .map(|s| s.metric_type == MetricType::Timer)
                    .unwrap_or(false)
            })
            .map(|(name, samples)| {
                let total: f64 = samples.iter().map(|s| s.value).sum();
                (name.clone(), samples.len(), total / samples.len() as f64)
            })
            .collect();
        timers.sort_by(|a, b| a.0.cmp(&b.0));
        let timer_lines = timers
            .iter()
            .map(|(name, count, avg)| format!("  {}: {} samples, avg {:.3}ms", name, count, avg))
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "TableFlow Metrics Report\n\
            ========================\n\
            Uptime: {}s\n\
            Samples Recorded: {}\n\
            Samples Flushed: {}\n\
            Sample Rate: {}\n\
            \n\
            Counters:\n\
            {}\n\
            \n\
            Gauges:\n\
            {}\n\
            \n\
            Timers:\n\
            {}",
            self.inner.started.elapsed().as_secs(),
            state.total_recorded,
            state.total_flushed,
            self.inner.config.sample_rate,
            counter_lines,
            gauge_lines,
            timer_lines,
        )
    }
}

impl Drop for MetricsManager {
    fn drop(&mut self) {
        if let Some(handle) = self.flush_task.lock().take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for MetricsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsManager")
            .field("config", &self.inner.config)
            .finish()
    }
}

struct TimerGuard<'a> {
    metrics: &'a MetricsManager,
    handle: TimerHandle,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.stop_timer(self.handle);
    }
}
