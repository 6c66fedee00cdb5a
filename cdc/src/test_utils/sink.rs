use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::sink::Sink;
use crate::test_utils::event::{EventLog, TestEvent};
use crate::types::Row;

/// Sink recording published rows into an [`EventLog`], optionally rejecting some of them.
#[derive(Debug, Clone)]
pub struct RecordingSink {
    log: EventLog,
    reject_when: Option<fn(&Row) -> bool>,
    rejections_left: Arc<AtomicUsize>,
}

impl RecordingSink {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            reject_when: None,
            rejections_left: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Rejects the first `times` rows matching `predicate`.
    pub fn rejecting(mut self, times: usize, predicate: fn(&Row) -> bool) -> Self {
        self.reject_when = Some(predicate);
        self.rejections_left = Arc::new(AtomicUsize::new(times));
        self
    }

    fn should_reject(&self, row: &Row) -> bool {
        let Some(predicate) = self.reject_when else {
            return false;
        };

        predicate(row)
            && self
                .rejections_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok()
    }
}

impl Sink for RecordingSink {
    fn name() -> &'static str {
        "recording"
    }

    async fn publish(&self, row: Row) -> CdcResult<()> {
        if self.should_reject(&row) {
            self.log.push(TestEvent::PublishFailed(row));

            return Err(cdc_error!(ErrorKind::Unknown, "Recording sink rejected the row"));
        }

        self.log.push(TestEvent::Published(row));

        Ok(())
    }
}

/// Sink whose publish never completes.
#[derive(Debug, Clone, Default)]
pub struct HangingSink;

impl Sink for HangingSink {
    fn name() -> &'static str {
        "hanging"
    }

    async fn publish(&self, _row: Row) -> CdcResult<()> {
        std::future::pending::<()>().await;

        Ok(())
    }
}

/// Sink that panics on the first published row.
#[derive(Debug, Clone, Default)]
pub struct PanickingSink;

impl Sink for PanickingSink {
    fn name() -> &'static str {
        "panicking"
    }

    async fn publish(&self, row: Row) -> CdcResult<()> {
        panic!("panicking sink received {row}");
    }
}
