use thiserror::Error;

/// Errors that can occur during configuration validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// TLS is enabled but no trusted root certificates are provided.
    #[error("Invalid TLS config: `trusted_root_certs` must be set when `enabled` is true")]
    MissingTrustedRootCerts,

    /// A required name is empty.
    #[error("Invalid replication config: `{0}` cannot be empty")]
    EmptyName(&'static str),

    /// An interval is zero.
    #[error("Invalid replication config: `{0}` must be greater than zero")]
    ZeroInterval(&'static str),

    /// A sink setting is out of range.
    #[error("Invalid sink config: {0}")]
    InvalidSink(String),
}
