//! Self-signed certificate fallback.
//!
//! Used when an HTTPS mapping is configured without `--cert`/`--key`.

use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DnType, KeyPair};
use time::{Duration, OffsetDateTime};
use tracing::info;

use super::error::{TlsError, TlsResult};

/// Validity period of generated certificates.
const VALIDITY_DAYS: i64 = 365;

/// Generate a self-signed ECDSA P-256 certificate and write the pair to
/// `cert.pem` / `key.pem` under `dir`.
///
/// Returns the written paths.
///
/// # Errors
///
/// Returns an error if generation or writing fails. Fatal at startup.
pub fn generate_self_signed(dir: &Path) -> TlsResult<(PathBuf, PathBuf)> {
    let mut params = CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| TlsError::GenerateError(e.to_string()))?;
    params
        .distinguished_name
        .push(DnType::OrganizationName, "dnslb");
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = params.not_before + Duration::days(VALIDITY_DAYS);

    // rcgen's default key algorithm is ECDSA over P-256.
    let key_pair = KeyPair::generate().map_err(|e| TlsError::GenerateError(e.to_string()))?;
    let certificate = params
        .self_signed(&key_pair)
        .map_err(|e| TlsError::GenerateError(e.to_string()))?;

    let cert_path = dir.join("cert.pem");
    let key_path = dir.join("key.pem");

    std::fs::write(&cert_path, certificate.pem()).map_err(|e| TlsError::WriteError {
        path: cert_path.display().to_string(),
        source: e,
    })?;
    std::fs::write(&key_path, key_pair.serialize_pem()).map_err(|e| TlsError::WriteError {
        path: key_path.display().to_string(),
        source: e,
    })?;

    info!(cert = %cert_path.display(), key = %key_path.display(), "Self signed certificate generated");
    Ok((cert_path, key_path))
}
