use config::shared::SinkLogLevel;
use tracing::{Level, event};

use crate::error::CdcResult;
use crate::sink::Sink;
use crate::types::Row;

/// Sink writing every row to the log as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingSink {
    level: SinkLogLevel,
}

impl LoggingSink {
    pub fn new(level: SinkLogLevel) -> Self {
        Self { level }
    }
}

impl Sink for LoggingSink {
    fn name() -> &'static str {
        "logging"
    }

    async fn publish(&self, row: Row) -> CdcResult<()> {
        let row = serde_json::to_string(&row)?;

        // The level of `event!` has to be a constant.
        match self.level {
            SinkLogLevel::Trace => event!(Level::TRACE, %row, "row published"),
            SinkLogLevel::Debug => event!(Level::DEBUG, %row, "row published"),
            SinkLogLevel::Info => event!(Level::INFO, %row, "row published"),
            SinkLogLevel::Warn => event!(Level::WARN, %row, "row published"),
            SinkLogLevel::Error => event!(Level::ERROR, %row, "row published"),
        }

        Ok(())
    }
}
