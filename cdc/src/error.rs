//! Error types and result definitions for change data capture operations.
//!
//! Every fallible operation of the consumer returns [`CdcResult`]. A [`CdcError`] carries an
//! [`ErrorKind`] used by the consumer loop to decide how to react (reconnect, skip the payload,
//! stop), a static description, optional dynamic detail, the originating error and the callsite.

use std::backtrace::Backtrace;
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for operations using [`CdcError`] as the error type.
pub type CdcResult<T> = Result<T, CdcError>;

/// Detailed payload stored for each [`CdcError`].
#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the consumer.
///
/// Errors are cheap to clone since the source and backtrace are reference counted, which lets
/// the consumer loop log an error and still hand it to whoever waits on the worker.
#[derive(Debug, Clone)]
pub struct CdcError {
    payload: ErrorPayload,
}

/// Specific categories of errors that can occur while consuming a replication slot.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    SourceConnectionFailed,
    AuthenticationError,
    SourceQueryFailed,
    SourceIoError,

    // Replication Slot Errors
    ReplicationSlotBusy,
    ReplicationSlotAlreadyExists,
    ReplicationSlotNotCreated,

    // Data Errors
    MalformedEnvelope,
    ConversionError,

    // Sink Errors
    PublishFailed,

    // Worker Lifecycle Errors
    InvalidState,
    ConsumerWorkerPanic,
    ConsumerWorkerCancelled,
    ShutdownTimeout,

    // IO Errors
    IoError,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` when the error is caused by the source connection or the slot and is
    /// handled by closing the stream and reopening it after a delay.
    pub fn requires_reconnect(&self) -> bool {
        !matches!(self, ErrorKind::MalformedEnvelope)
    }
}

impl CdcError {
    /// Returns the [`ErrorKind`] of this error.
    pub fn kind(&self) -> ErrorKind {
        self.payload.kind
    }

    /// Returns the static description of this error.
    pub fn description(&self) -> &str {
        &self.payload.description
    }

    /// Returns the detailed error information if available.
    pub fn detail(&self) -> Option<&str> {
        self.payload.detail.as_deref()
    }

    /// Returns the captured backtrace for this error.
    pub fn backtrace(&self) -> &Backtrace {
        self.payload.backtrace.as_ref()
    }

    /// Returns the captured callsite location for this error.
    pub fn location(&self) -> &'static Location<'static> {
        self.payload.location
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.payload.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        CdcError {
            payload: ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            },
        }
    }
}

impl PartialEq for CdcError {
    fn eq(&self, other: &CdcError) -> bool {
        self.payload.kind == other.payload.kind
    }
}

impl fmt::Display for CdcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        let payload = &self.payload;
        let location = payload.location;
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            payload.kind,
            payload.description,
            location.file(),
            location.line(),
            location.column()
        )?;

        if let Some(detail) = payload.detail.as_deref() {
            if detail.trim().is_empty() {
                write!(f, "\n  Detail: <empty>")?;
            } else {
                write!(f, "\n  Detail:")?;
                for line in detail.lines() {
                    write!(f, "\n    {line}")?;
                }
            }
        }

        Ok(())
    }
}

impl error::Error for CdcError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.payload
            .source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

/// Creates a [`CdcError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for CdcError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`CdcError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for CdcError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> CdcError {
        CdcError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Converts [`std::io::Error`] to [`CdcError`] with [`ErrorKind::IoError`].
impl From<std::io::Error> for CdcError {
    #[track_caller]
    fn from(err: std::io::Error) -> CdcError {
        let detail = err.to_string();
        CdcError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`serde_json::Error`] to [`CdcError`].
///
/// Syntax, data and EOF failures all mean the payload is not a valid change envelope, so they
/// map to [`ErrorKind::MalformedEnvelope`].
impl From<serde_json::Error> for CdcError {
    #[track_caller]
    fn from(err: serde_json::Error) -> CdcError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::MalformedEnvelope, "Change envelope could not be decoded")
            }
        };

        let detail = err.to_string();
        CdcError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`tokio_postgres::Error`] to [`CdcError`] with the appropriate error kind.
///
/// Maps errors based on Postgres SQLSTATE codes. Errors without a code are raised by the client
/// itself, typically because the connection was lost.
impl From<tokio_postgres::Error> for CdcError {
    #[track_caller]
    fn from(err: tokio_postgres::Error) -> CdcError {
        let (kind, description) = match err.code() {
            Some(sqlstate) => {
                use tokio_postgres::error::SqlState;

                match *sqlstate {
                    // Connection errors (08xxx)
                    SqlState::CONNECTION_EXCEPTION
                    | SqlState::CONNECTION_DOES_NOT_EXIST
                    | SqlState::CONNECTION_FAILURE
                    | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                    | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION => (
                        ErrorKind::SourceConnectionFailed,
                        "PostgreSQL connection failed",
                    ),

                    // Authentication errors (28xxx)
                    SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                        ErrorKind::AuthenticationError,
                        "PostgreSQL authentication failed",
                    ),

                    // Object in use (55006), raised when another process streams from the slot.
                    SqlState::OBJECT_IN_USE => (
                        ErrorKind::ReplicationSlotBusy,
                        "Replication slot is in use by another process",
                    ),

                    // Duplicate object (42710), raised when the slot already exists.
                    SqlState::DUPLICATE_OBJECT => (
                        ErrorKind::ReplicationSlotAlreadyExists,
                        "Replication slot already exists",
                    ),

                    // Shutdown and resource errors (57Pxx, 53xxx)
                    SqlState::ADMIN_SHUTDOWN
                    | SqlState::CRASH_SHUTDOWN
                    | SqlState::CANNOT_CONNECT_NOW
                    | SqlState::TOO_MANY_CONNECTIONS => (
                        ErrorKind::SourceConnectionFailed,
                        "PostgreSQL is not accepting connections",
                    ),

                    _ => (ErrorKind::SourceQueryFailed, "PostgreSQL query failed"),
                }
            }
            None if err.is_closed() => (
                ErrorKind::SourceConnectionFailed,
                "PostgreSQL connection has been closed",
            ),
            None => (ErrorKind::SourceIoError, "PostgreSQL client operation failed"),
        };

        let detail = err.to_string();
        CdcError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Converts [`rustls::Error`] to [`CdcError`] with [`ErrorKind::SourceConnectionFailed`].
impl From<rustls::Error> for CdcError {
    #[track_caller]
    fn from(err: rustls::Error) -> CdcError {
        let detail = err.to_string();
        CdcError::from_components(
            ErrorKind::SourceConnectionFailed,
            Cow::Borrowed("TLS configuration failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, cdc_error};

    #[test]
    fn test_error_kind_and_detail() {
        let err = cdc_error!(
            ErrorKind::MalformedEnvelope,
            "Column count mismatch",
            "2 names, 1 value"
        );

        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        assert_eq!(err.description(), "Column count mismatch");
        assert_eq!(err.detail(), Some("2 names, 1 value"));
    }

    #[test]
    fn test_display_contains_kind_description_and_detail() {
        let err = cdc_error!(
            ErrorKind::ReplicationSlotBusy,
            "Slot busy",
            "slot 'orders_slot' is active"
        );
        let rendered = err.to_string();

        assert!(rendered.starts_with("[ReplicationSlotBusy] Slot busy @ "));
        assert!(rendered.contains("Detail:"));
        assert!(rendered.contains("slot 'orders_slot' is active"));
    }

    #[test]
    fn test_bail_returns_error() {
        fn fails() -> CdcResult<()> {
            bail!(ErrorKind::InvalidState, "Stream is closed");
        }

        let err = fails().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(err.detail().is_none());
    }

    #[test]
    fn test_serde_json_error_is_malformed_envelope() {
        let err: CdcError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();

        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        assert!(error::Error::source(&err).is_some());
    }

    #[test]
    fn test_only_malformed_envelope_skips_reconnect() {
        assert!(!ErrorKind::MalformedEnvelope.requires_reconnect());
        assert!(ErrorKind::SourceConnectionFailed.requires_reconnect());
        assert!(ErrorKind::ReplicationSlotBusy.requires_reconnect());
        assert!(ErrorKind::PublishFailed.requires_reconnect());
    }

    #[test]
    fn test_errors_compare_by_kind() {
        let a = CdcError::from((ErrorKind::PublishFailed, "first"));
        let b = CdcError::from((ErrorKind::PublishFailed, "second"));
        let c = CdcError::from((ErrorKind::IoError, "first"));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
