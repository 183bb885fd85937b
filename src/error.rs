//! Error types for skua

use thiserror::Error;

/// Result type alias using the skua Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in skua operations
#[derive(Error, Debug)]
pub enum Error {
    /// Framing errors on any transport
    #[error("Framing error: {0}")]
    Wire(#[from] skua_wire::WireError),

    /// Certificate chain or revocation-list verification failures
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Policy extension decoding or authorization failures
    #[error("Policy error: {0}")]
    Policy(String),

    /// Delegation resource algebra violations
    #[error("Resource error: {0}")]
    Resource(String),

    /// Name collisions and stale revocation lists
    #[error("Conflict: {0}")]
    Conflict(String),

    /// VM spawn failures
    #[error("Spawn error: {0}")]
    Spawn(String),

    /// Helper socket failures
    #[error("Helper error: {0}")]
    Helper(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS errors
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}
