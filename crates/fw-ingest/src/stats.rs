//! Pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters shared by the gateway and every plate worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    received: AtomicU64,
    malformed: AtomicU64,
    duplicates: AtomicU64,
    late: AtomicU64,
    processed: AtomicU64,
    writes_ok: AtomicU64,
    write_retries: AtomicU64,
    writes_rejected: AtomicU64,
    writes_dropped: AtomicU64,
    adoptions: AtomicU64,
    resumed: AtomicU64,
    workers: AtomicU64,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub duplicates: u64,
    pub late: u64,
    pub processed: u64,
    pub writes_ok: u64,
    pub write_retries: u64,
    pub writes_rejected: u64,
    pub writes_dropped: u64,
    pub adoptions: u64,
    pub resumed: u64,
    pub workers: u64,
}

macro_rules! counters {
    ($($field:ident => $inc:ident),* $(,)?) => {
        impl IngestStats {
            $(
                pub(crate) fn $inc(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*

            pub fn snapshot(&self) -> IngestStatsSnapshot {
                IngestStatsSnapshot {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    received => add_received,
    malformed => add_malformed,
    duplicates => add_duplicates,
    late => add_late,
    processed => add_processed,
    writes_ok => add_writes_ok,
    write_retries => add_write_retries,
    writes_rejected => add_writes_rejected,
    writes_dropped => add_writes_dropped,
    adoptions => add_adoptions,
    resumed => add_resumed,
    workers => add_workers,
}
