//! Certificate loading.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls_pemfile::{certs, private_key};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::info;

use super::error::{TlsError, TlsResult};

/// Load a PEM certificate chain and private key into a rustls server
/// configuration.
///
/// # Errors
///
/// Returns an error if either file cannot be read or the pair does not
/// form a valid server identity. Fatal at startup.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> TlsResult<Arc<ServerConfig>> {
    let certificates = load_certificates(cert_path)?;
    if certificates.is_empty() {
        return Err(TlsError::CertificateLoadError {
            path: cert_path.display().to_string(),
            message: "No certificates found in file".to_string(),
        });
    }
    let key = load_private_key(key_path)?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        chain_len = certificates.len(),
        "TLS certificate loaded"
    );

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, key)
        .map_err(|e| TlsError::InvalidCertificateChain {
            message: e.to_string(),
        })?;

    Ok(Arc::new(config))
}

/// Load certificates from a PEM file.
fn load_certificates(path: &Path) -> TlsResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| TlsError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    let certs_result: Result<Vec<_>, _> = certs(&mut reader).collect();
    certs_result.map_err(|e| TlsError::CertificateLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Load a private key from a PEM file.
fn load_private_key(path: &Path) -> TlsResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| TlsError::PrivateKeyLoadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let mut reader = BufReader::new(file);

    private_key(&mut reader)
        .map_err(|e| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: e.to_string(),
        })?
        .ok_or_else(|| TlsError::PrivateKeyLoadError {
            path: path.display().to_string(),
            message: "No private key found in file".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tls_terminator::self_signed::generate_self_signed;

    #[test]
    fn test_missing_files_fail() {
        let missing = Path::new("/nonexistent/cert.pem");
        assert!(matches!(
            load_server_config(missing, missing),
            Err(TlsError::CertificateLoadError { .. })
        ));
    }

    #[test]
    fn test_generated_pair_loads() {
        let dir = std::env::temp_dir().join(format!("dnslb-tls-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let (cert_path, key_path) = generate_self_signed(&dir).unwrap();
        let config = load_server_config(&cert_path, &key_path);
        assert!(config.is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
