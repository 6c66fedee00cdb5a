use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CdcResult;
use crate::sink::Sink;
use crate::types::Row;

/// Sink keeping every published row in memory.
///
/// Clones share the same storage, so a clone can be handed to a pipeline while the original
/// is used to inspect what was published.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<Row>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the rows published so far, in publication order.
    pub async fn rows(&self) -> Vec<Row> {
        self.rows.lock().await.clone()
    }

    pub async fn clear(&self) {
        self.rows.lock().await.clear();
    }
}

impl Sink for MemorySink {
    fn name() -> &'static str {
        "memory"
    }

    async fn publish(&self, row: Row) -> CdcResult<()> {
        debug!(%row, "storing row in memory");
        self.rows.lock().await.push(row);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_rows_are_shared_between_clones() {
        let sink = MemorySink::new();
        let row: Row = [("id", json!(7))].into_iter().collect();

        sink.clone().publish(row.clone()).await.unwrap();

        assert_eq!(sink.rows().await, vec![row]);

        sink.clear().await;
        assert!(sink.rows().await.is_empty());
    }
}
