//! Observability events emitted by the read path

use std::time::Duration;

/// Outcome of a primary-store fetch, as reported to metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Found,
    NotFound,
    Failed,
    TimedOut,
}

impl FetchOutcome {
    /// Metric label for the outcome
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchOutcome::Found => "found",
            FetchOutcome::NotFound => "not_found",
            FetchOutcome::Failed => "failed",
            FetchOutcome::TimedOut => "timed_out",
        }
    }
}

/// One notable step of a recap read
///
/// Events are notifications only; nothing in the read path depends on how
/// (or whether) they are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecapEvent {
    /// Valid entry served from the cache
    CacheHit,
    /// No usable entry in the cache
    CacheMiss,
    /// Entry present but rejected and purged
    CacheCorrupt,
    /// Fresh entry written after a primary fetch
    CacheWrite,
    /// Cache write failed or was skipped
    CacheWriteFailed,
    /// This caller won the repopulation lock
    LockAcquired,
    /// Another caller holds the repopulation lock
    LockContended,
    /// After backing off, the entry had been repopulated by the lock holder
    ContentionResolved,
    /// After backing off, the entry was still missing; fetching directly
    ContentionFallback,
    /// Caller joined an in-process fetch already running for the key
    Coalesced,
    /// Primary store fetch finished
    PrimaryFetch {
        outcome: FetchOutcome,
        elapsed: Duration,
    },
    /// The whole read exceeded its deadline
    DeadlineExceeded,
}

impl RecapEvent {
    /// Stable metric name for the event
    pub fn name(&self) -> &'static str {
        match self {
            RecapEvent::CacheHit => "cache_hit",
            RecapEvent::CacheMiss => "cache_miss",
            RecapEvent::CacheCorrupt => "cache_corrupt",
            RecapEvent::CacheWrite => "cache_write",
            RecapEvent::CacheWriteFailed => "cache_write_failed",
            RecapEvent::LockAcquired => "lock_acquired",
            RecapEvent::LockContended => "lock_contended",
            RecapEvent::ContentionResolved => "contention_resolved",
            RecapEvent::ContentionFallback => "contention_fallback",
            RecapEvent::Coalesced => "coalesced",
            RecapEvent::PrimaryFetch { .. } => "primary_fetch",
            RecapEvent::DeadlineExceeded => "deadline_exceeded",
        }
    }
}
