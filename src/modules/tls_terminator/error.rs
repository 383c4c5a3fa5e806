//! TLS error types.

use thiserror::Error;

/// Errors that can occur loading or generating TLS material.
///
/// All variants are fatal at startup.
#[derive(Debug, Error)]
pub enum TlsError {
    /// Failed to load a certificate file.
    #[error("failed to load certificate from {path}: {message}")]
    CertificateLoadError {
        /// Path to the certificate file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// Failed to load a private key file.
    #[error("failed to load private key from {path}: {message}")]
    PrivateKeyLoadError {
        /// Path to the key file.
        path: String,
        /// What went wrong.
        message: String,
    },

    /// The certificate chain and key do not form a valid server identity.
    #[error("invalid certificate chain: {message}")]
    InvalidCertificateChain {
        /// What went wrong.
        message: String,
    },

    /// Self-signed certificate generation failed.
    #[error("failed to generate self-signed certificate: {0}")]
    GenerateError(String),

    /// Writing generated material to disk failed.
    #[error("failed to write {path}: {source}")]
    WriteError {
        /// Path being written.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for TLS operations.
pub type TlsResult<T> = Result<T, TlsError>;
