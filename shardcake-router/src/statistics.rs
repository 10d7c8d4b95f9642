use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the router and the operations issued through it.
///
/// Recording is a relaxed atomic add, it never blocks nor fails.
pub struct RouterStatistics(Arc<RouterStatisticsInner>);

impl Deref for RouterStatistics {
    type Target = RouterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct RouterStatisticsInner {
    /// The number of read statements issued.
    pub(crate) num_reads: Counter,
    /// The number of write statements issued.
    pub(crate) num_writes: Counter,
    /// The total number of rows affected by write statements.
    pub(crate) num_affected_rows: Counter,
    /// The total number of rows consumed from read statements.
    pub(crate) num_selected_rows: Counter,
    /// The number of routing tables successfully published.
    pub(crate) num_reconfigurations: Counter,
    /// The number of reconfiguration attempts which were rejected.
    pub(crate) num_failed_reconfigurations: Counter,
    /// The number of pools which failed to close.
    pub(crate) num_close_failures: Counter,
}

impl RouterStatisticsInner {
    /// The number of read statements issued.
    pub fn num_reads(&self) -> u64 {
        self.num_reads.load(Ordering::Relaxed)
    }

    /// The number of write statements issued.
    pub fn num_writes(&self) -> u64 {
        self.num_writes.load(Ordering::Relaxed)
    }

    /// The total number of rows affected by write statements.
    pub fn num_affected_rows(&self) -> u64 {
        self.num_affected_rows.load(Ordering::Relaxed)
    }

    /// The total number of rows consumed from read statements.
    pub fn num_selected_rows(&self) -> u64 {
        self.num_selected_rows.load(Ordering::Relaxed)
    }

    /// The number of routing tables successfully published.
    pub fn num_reconfigurations(&self) -> u64 {
        self.num_reconfigurations.load(Ordering::Relaxed)
    }

    /// The number of reconfiguration attempts which were rejected.
    pub fn num_failed_reconfigurations(&self) -> u64 {
        self.num_failed_reconfigurations.load(Ordering::Relaxed)
    }

    /// The number of pools which failed to close.
    pub fn num_close_failures(&self) -> u64 {
        self.num_close_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn record_read(&self, sql: &str, start: Instant) {
        self.num_reads.fetch_add(1, Ordering::Relaxed);
        trace!(
            sql = sql,
            elapsed = ?start.elapsed(),
            "Read statement completed."
        );
    }

    pub(crate) fn record_write(&self, sql: &str, start: Instant) {
        self.num_writes.fetch_add(1, Ordering::Relaxed);
        trace!(
            sql = sql,
            elapsed = ?start.elapsed(),
            "Write statement completed."
        );
    }

    pub(crate) fn record_affected_rows(&self, n: u64) {
        if n > 0 {
            self.num_affected_rows.fetch_add(n, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_selected_rows(&self, n: u64) {
        if n > 0 {
            self.num_selected_rows.fetch_add(n, Ordering::Relaxed);
        }
    }
}
