//! Shared ingestion counters and the periodic/final summary line.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Process-wide counters. Cheap to bump from concurrent fetch tasks.
#[derive(Debug, Default)]
pub struct IngestCounters {
    api_calls: AtomicU64,
    rate_limit_hits: AtomicU64,
    transient_errors: AtomicU64,
    not_found: AtomicU64,
    processed: AtomicU64,
    inserted: AtomicU64,
    updated: AtomicU64,
    skipped: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
    batches: AtomicU64,
}

macro_rules! counter_ops {
    ($($op:ident $field:ident => $name:ident;)*) => {
        $( counter_ops!(@$op $field $name); )*
    };
    (@inc $field:ident $name:ident) => {
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
    (@add $field:ident $name:ident) => {
        pub fn $name(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }
    };
}

impl IngestCounters {
    pub fn new() -> Self {
        Self::default()
    }

    counter_ops! {
        inc api_calls => inc_api_calls;
        inc rate_limit_hits => inc_rate_limit_hits;
        inc transient_errors => inc_transient_errors;
        inc not_found => inc_not_found;
        inc batches => inc_batches;
        add processed => add_processed;
        add inserted => add_inserted;
        add updated => add_updated;
        add skipped => add_skipped;
        add rejected => add_rejected;
        add errors => add_errors;
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            api_calls: self.api_calls.load(Ordering::Relaxed),
            rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
            transient_errors: self.transient_errors.load(Ordering::Relaxed),
            not_found: self.not_found.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub api_calls: u64,
    pub rate_limit_hits: u64,
    pub transient_errors: u64,
    pub not_found: u64,
    pub processed: u64,
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
    pub rejected: u64,
    pub errors: u64,
    pub batches: u64,
}

impl CounterSnapshot {
    /// Processed rows per second over `elapsed`.
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= f64::EPSILON {
            return 0.0;
        }
        self.processed as f64 / secs
    }

    /// Emit the summary line through tracing.
    pub fn log(&self, label: &str, stream: &str, elapsed: Duration) {
        tracing::info!(
            stream,
            processed = self.processed,
            inserted = self.inserted,
            updated = self.updated,
            skipped = self.skipped,
            rejected = self.rejected,
            errors = self.errors,
            batches = self.batches,
            api_calls = self.api_calls,
            rate_limit_hits = self.rate_limit_hits,
            rows_per_sec = %format!("{:.1}", self.throughput(elapsed)),
            elapsed_secs = elapsed.as_secs(),
            "{label}"
        );
    }
}
