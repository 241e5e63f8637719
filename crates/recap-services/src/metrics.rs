//! Metrics sinks for the read path
//!
//! All sinks are infallible and non-blocking; `record` only touches atomics
//! or emits a tracing event.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};
use recap_core::models::{FetchOutcome, RecapEvent};
use recap_core::traits::MetricsSink;
use recap_core::{AppError, AppResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Emits every event as a debug-level tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record(&self, event: RecapEvent) {
        match event {
            RecapEvent::PrimaryFetch { outcome, elapsed } => {
                debug!(
                    metric = event.name(),
                    outcome = outcome.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "recap metric"
                );
            }
            _ => debug!(metric = event.name(), "recap metric"),
        }
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record(&self, _event: RecapEvent) {}
}

/// Forwards each event to several sinks
#[derive(Default, Clone)]
pub struct FanoutMetrics {
    sinks: Vec<Arc<dyn MetricsSink>>,
}

impl FanoutMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl MetricsSink for FanoutMetrics {
    fn record(&self, event: RecapEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

/// In-process counters for the read path
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    corrupt: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
    locks_acquired: AtomicU64,
    lock_contention: AtomicU64,
    contention_resolved: AtomicU64,
    contention_fallback: AtomicU64,
    coalesced: AtomicU64,
    primary_fetches: AtomicU64,
    primary_failures: AtomicU64,
    primary_fetch_micros: AtomicU64,
    deadline_exceeded: AtomicU64,
}

/// Point-in-time copy of [`CacheCounters`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub corrupt: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub locks_acquired: u64,
    pub lock_contention: u64,
    pub contention_resolved: u64,
    pub contention_fallback: u64,
    pub coalesced: u64,
    pub primary_fetches: u64,
    pub primary_failures: u64,
    pub avg_primary_fetch_ms: f64,
    pub deadline_exceeded: u64,
    pub hit_ratio: f64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let hits = load(&self.hits);
        let misses = load(&self.misses);
        let primary_fetches = load(&self.primary_fetches);
        let lookups = hits + misses;

        CounterSnapshot {
            hits,
            misses,
            corrupt: load(&self.corrupt),
            writes: load(&self.writes),
            write_failures: load(&self.write_failures),
            locks_acquired: load(&self.locks_acquired),
            lock_contention: load(&self.lock_contention),
            contention_resolved: load(&self.contention_resolved),
            contention_fallback: load(&self.contention_fallback),
            coalesced: load(&self.coalesced),
            primary_fetches,
            primary_failures: load(&self.primary_failures),
            avg_primary_fetch_ms: if primary_fetches == 0 {
                0.0
            } else {
                load(&self.primary_fetch_micros) as f64 / primary_fetches as f64 / 1000.0
            },
            deadline_exceeded: load(&self.deadline_exceeded),
            hit_ratio: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricsSink for CacheCounters {
    fn record(&self, event: RecapEvent) {
        match event {
            RecapEvent::CacheHit => Self::bump(&self.hits),
            RecapEvent::CacheMiss => Self::bump(&self.misses),
            RecapEvent::CacheCorrupt => Self::bump(&self.corrupt),
            RecapEvent::CacheWrite => Self::bump(&self.writes),
            RecapEvent::CacheWriteFailed => Self::bump(&self.write_failures),
            RecapEvent::LockAcquired => Self::bump(&self.locks_acquired),
            RecapEvent::LockContended => Self::bump(&self.lock_contention),
            RecapEvent::ContentionResolved => Self::bump(&self.contention_resolved),
            RecapEvent::ContentionFallback => Self::bump(&self.contention_fallback),
            RecapEvent::Coalesced => Self::bump(&self.coalesced),
            RecapEvent::PrimaryFetch { outcome, elapsed } => {
                Self::bump(&self.primary_fetches);
                self.primary_fetch_micros
                    .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
                if matches!(outcome, FetchOutcome::Failed | FetchOutcome::TimedOut) {
                    Self::bump(&self.primary_failures);
                }
            }
            RecapEvent::DeadlineExceeded => Self::bump(&self.deadline_exceeded),
        }
    }
}

/// Content type of [`PrometheusMetrics::encode`] output
pub const METRICS_CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Primary fetch latency buckets (seconds)
const PRIMARY_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0,
];

/// Prometheus exposition of read-path events
///
/// Metrics live in a private registry under the `recap_` namespace:
///
/// - `recap_cache_hits_total`, `recap_cache_misses_total`
/// - `recap_events_total{event}` for every event
/// - `recap_primary_fetch_duration_seconds{outcome}`
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    events: IntCounterVec,
    primary_fetch_duration: HistogramVec,
}

fn registration_error(name: &str, err: prometheus::Error) -> AppError {
    AppError::Internal(format!("Failed to register {}: {}", name, err))
}

impl PrometheusMetrics {
    pub fn new() -> AppResult<Self> {
        let registry = Registry::new_custom(Some("recap".to_string()), None)
            .map_err(|e| registration_error("registry", e))?;

        let cache_hits = register_int_counter_with_registry!(
            "cache_hits_total",
            "Recap reads served from the cache",
            &registry
        )
        .map_err(|e| registration_error("cache_hits_total", e))?;

        let cache_misses = register_int_counter_with_registry!(
            "cache_misses_total",
            "Recap reads that found no usable cache entry",
            &registry
        )
        .map_err(|e| registration_error("cache_misses_total", e))?;

        let events = register_int_counter_vec_with_registry!(
            "events_total",
            "Read-path events by kind",
            &["event"],
            &registry
        )
        .map_err(|e| registration_error("events_total", e))?;

        let primary_fetch_duration = register_histogram_vec_with_registry!(
            "primary_fetch_duration_seconds",
            "Primary store fetch duration",
            &["outcome"],
            PRIMARY_LATENCY_BUCKETS.to_vec(),
            &registry
        )
        .map_err(|e| registration_error("primary_fetch_duration_seconds", e))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            events,
            primary_fetch_duration,
        })
    }

    /// Current values in the Prometheus text format
    pub fn encode(&self) -> AppResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| AppError::Internal(format!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer)
            .map_err(|e| AppError::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record(&self, event: RecapEvent) {
        match event {
            RecapEvent::CacheHit => self.cache_hits.inc(),
            RecapEvent::CacheMiss => self.cache_misses.inc(),
            RecapEvent::PrimaryFetch { outcome, elapsed } => self
                .primary_fetch_duration
                .with_label_values(&[outcome.as_str()])
                .observe(elapsed.as_secs_f64()),
            _ => {}
        }
        self.events.with_label_values(&[event.name()]).inc();
    }
}
