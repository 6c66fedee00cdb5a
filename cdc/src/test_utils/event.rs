use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

use crate::error::ErrorKind;
use crate::types::{PollResult, Row};

/// Something observed by a scripted stream or a recording sink.
#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    OpenFailed(ErrorKind),
    Opened,
    /// A poll returned `result`, or failed when `result` is `None`.
    Polled {
        at: Instant,
        result: Option<PollResult>,
    },
    Acknowledged(PgLsn),
    Closed,
    Published(Row),
    PublishFailed(Row),
}

/// Ordered log of [`TestEvent`]s shared between streams and sinks.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<TestEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TestEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, event: TestEvent) {
        self.lock().push(event);
    }

    /// Returns a copy of every event recorded so far.
    pub fn events(&self) -> Vec<TestEvent> {
        self.lock().clone()
    }

    /// Returns the events without the poll entries, which are usually too many to compare.
    pub fn events_without_polls(&self) -> Vec<TestEvent> {
        self.lock()
            .iter()
            .filter(|event| !matches!(event, TestEvent::Polled { .. }))
            .cloned()
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<PgLsn> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                TestEvent::Acknowledged(cursor) => Some(*cursor),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<Row> {
        self.lock()
            .iter()
            .filter_map(|event| match event {
                TestEvent::Published(row) => Some(row.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&TestEvent) -> bool) -> usize {
        self.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Waits until `condition` holds for the recorded events.
    ///
    /// Checks every millisecond of (possibly paused) tokio time.
    pub async fn wait_until(&self, condition: impl Fn(&[TestEvent]) -> bool) {
        loop {
            if condition(&self.lock()) {
                return;
            }

            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}
