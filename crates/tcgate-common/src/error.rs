//! Error types for tcgate

use thiserror::Error;

/// tcgate error type
#[derive(Error, Debug)]
pub enum TcgateError {
    /// Attachment point name not recognised
    #[error("unknown attachment point: {0}")]
    UnknownAttachPoint(String),

    /// IP protocol not handled by the dataplane
    #[error("unsupported IP protocol: {0}")]
    UnsupportedProtocol(u8),

    /// Invalid policy
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

/// Result type for tcgate
pub type TcgateResult<T> = Result<T, TcgateError>;
