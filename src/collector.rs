//! Concurrency-safe accumulation of normalized records.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use crate::models::{Batch, CanonicalRecord};

#[derive(Debug, Default)]
struct Inner {
    records: Vec<CanonicalRecord>,
    seen_urls: HashSet<String>,
    dropped: usize,
}

/// Owns the batch while a run is in progress.
///
/// `add` may be called from any number of concurrent units; records keep the
/// order in which their `add` calls completed. [`Collector::finish`] consumes
/// the collector and hands the batch to the caller.
#[derive(Debug, Default)]
pub struct Collector {
    dedupe_by_url: bool,
    inner: Mutex<Inner>,
}

impl Collector {
    pub fn new(dedupe_by_url: bool) -> Self {
        Self {
            dedupe_by_url,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicked producer cannot leave the list half-appended.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a record. Returns `false` if it was dropped as a URL duplicate.
    pub fn add(&self, record: CanonicalRecord) -> bool {
        let mut inner = self.lock();
        if self.dedupe_by_url && !inner.seen_urls.insert(record.url.clone()) {
            inner.dropped += 1;
            debug!(url = %record.url, "Dropping duplicate record");
            return false;
        }
        inner.records.push(record);
        true
    }

    /// Number of records dropped as duplicates so far.
    pub fn dropped(&self) -> usize {
        self.lock().dropped
    }

    pub fn finish(self) -> Batch {
        let inner = self
            .inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        info!(
            records = inner.records.len(),
            duplicates = inner.dropped,
            "Collector finished"
        );
        Batch::new(inner.records)
    }
}
