use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

use crate::error::CdcResult;
use crate::sink::Sink;
use crate::types::Row;

/// Sink counting rows and logging the running total every `log_every` rows.
#[derive(Debug, Clone)]
pub struct CountingSink {
    count: Arc<AtomicU64>,
    log_every: u64,
}

impl CountingSink {
    pub fn new(log_every: u64) -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            log_every: log_every.max(1),
        }
    }

    /// Returns the number of rows published so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Sink for CountingSink {
    fn name() -> &'static str {
        "counting"
    }

    async fn publish(&self, _row: Row) -> CdcResult<()> {
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.log_every == 0 {
            info!(count, "rows published");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_published_rows_across_clones() {
        let sink = CountingSink::new(2);
        let clone = sink.clone();

        for id in 0..3 {
            let row: Row = [("id", json!(id))].into_iter().collect();
            clone.publish(row).await.unwrap();
        }

        assert_eq!(sink.count(), 3);
    }
}
