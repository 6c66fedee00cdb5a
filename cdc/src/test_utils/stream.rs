use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::time::Instant;
use tokio_postgres::types::PgLsn;

use crate::cdc_error;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::stream::{ReplicationStream, ReplicationStreamOpener};
use crate::test_utils::event::{EventLog, TestEvent};
use crate::types::PollResult;

/// Outcome of a single poll of a [`ScriptedStream`].
#[derive(Debug, Clone)]
pub enum PollStep {
    Result(PollResult),
    Fail(ErrorKind),
}

impl PollStep {
    pub fn changes(payload: impl Into<Bytes>, cursor: u64) -> Self {
        PollStep::Result(PollResult::Changes {
            payload: payload.into(),
            cursor: PgLsn::from(cursor),
        })
    }

    pub fn keepalive(cursor: u64) -> Self {
        PollStep::Result(PollResult::Keepalive {
            cursor: PgLsn::from(cursor),
        })
    }

    pub fn empty() -> Self {
        PollStep::Result(PollResult::Empty)
    }
}

/// Outcome of a single call to [`ScriptedOpener::open`].
#[derive(Debug, Clone)]
pub enum OpenStep {
    Fail(ErrorKind),
    /// Opens a stream replaying the given polls, then returning [`PollResult::Empty`].
    Stream(Vec<PollStep>),
}

/// [`ReplicationStreamOpener`] replaying a script of [`OpenStep`]s.
///
/// Once the script is exhausted every open succeeds with an idle stream.
#[derive(Debug, Clone)]
pub struct ScriptedOpener {
    steps: Arc<Mutex<VecDeque<OpenStep>>>,
    log: EventLog,
}

impl ScriptedOpener {
    pub fn new(steps: Vec<OpenStep>, log: EventLog) -> Self {
        Self {
            steps: Arc::new(Mutex::new(steps.into())),
            log,
        }
    }

    fn next_step(&self) -> Option<OpenStep> {
        self.steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl ReplicationStreamOpener for ScriptedOpener {
    type Stream = ScriptedStream;

    async fn open(&self) -> CdcResult<ScriptedStream> {
        let polls = match self.next_step() {
            Some(OpenStep::Fail(kind)) => {
                self.log.push(TestEvent::OpenFailed(kind));

                return Err(cdc_error!(kind, "Scripted open failure"));
            }
            Some(OpenStep::Stream(polls)) => polls,
            None => Vec::new(),
        };

        self.log.push(TestEvent::Opened);

        Ok(ScriptedStream {
            polls: polls.into(),
            log: self.log.clone(),
            acknowledged: PgLsn::from(0),
            closed: false,
        })
    }
}

/// [`ReplicationStream`] replaying a script of [`PollStep`]s.
#[derive(Debug)]
pub struct ScriptedStream {
    polls: VecDeque<PollStep>,
    log: EventLog,
    acknowledged: PgLsn,
    closed: bool,
}

impl ReplicationStream for ScriptedStream {
    async fn poll(&mut self) -> CdcResult<PollResult> {
        if self.closed {
            return Err(cdc_error!(ErrorKind::InvalidState, "Scripted stream is closed"));
        }

        let step = self.polls.pop_front().unwrap_or_else(PollStep::empty);
        let at = Instant::now();

        match step {
            PollStep::Result(result) => {
                self.log.push(TestEvent::Polled {
                    at,
                    result: Some(result.clone()),
                });

                Ok(result)
            }
            PollStep::Fail(kind) => {
                self.log.push(TestEvent::Polled { at, result: None });

                Err(cdc_error!(kind, "Scripted poll failure"))
            }
        }
    }

    async fn acknowledge(&mut self, cursor: PgLsn) -> CdcResult<()> {
        if cursor > self.acknowledged {
            self.acknowledged = cursor;
        }
        self.log.push(TestEvent::Acknowledged(cursor));

        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.push(TestEvent::Closed);
        }
    }
}
