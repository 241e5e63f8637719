//! Recap read path
//!
//! Composes the primary store and the cache tier into one
//! `get_recap(key)` contract: cache-aside reads, a per-key repopulation
//! lock against stampedes, self-healing of corrupt entries, and fail-soft
//! behaviour whenever the cache tier is unavailable.
//!
//! # Components
//!
//! - `RecapOrchestrator` - the read-through orchestrator
//! - `ReadPolicy` - TTLs, backoff, timeouts and the stampede strategy
//! - `TracingMetrics`, `CacheCounters`, `PrometheusMetrics`, `FanoutMetrics`,
//!   `NoopMetrics` - `MetricsSink` implementations

pub mod metrics;
pub mod orchestrator;
pub mod policy;

pub use metrics::{
    CacheCounters, CounterSnapshot, FanoutMetrics, NoopMetrics, PrometheusMetrics,
    TracingMetrics, METRICS_CONTENT_TYPE,
};
pub use orchestrator::{DynRecapOrchestrator, RecapOrchestrator};
pub use policy::ReadPolicy;
