//! TLS client configuration for `ssl:` endpoints
//!
//! ovsdb-server is normally deployed with a private CA, so the trust store is
//! built only from the given CA bundle rather than the system roots.

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{OvsdbError, Result};

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| OvsdbError::Tls(format!("Failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| OvsdbError::Tls(format!("Malformed PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(OvsdbError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Build a client config trusting `ca_cert`, optionally presenting a client
/// certificate. `client_cert` and `client_key` must be given together.
pub fn load_client_config(
    ca_cert: &Path,
    client_cert: Option<&Path>,
    client_key: Option<&Path>,
) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(ca_cert)? {
        roots
            .add(cert)
            .map_err(|e| OvsdbError::Tls(format!("Invalid CA certificate: {}", e)))?;
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let config = match (client_cert, client_key) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key_file = File::open(key_path).map_err(|e| {
                OvsdbError::Tls(format!("Failed to open {}: {}", key_path.display(), e))
            })?;
            let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
                .map_err(|e| {
                    OvsdbError::Tls(format!("Malformed PEM in {}: {}", key_path.display(), e))
                })?
                .ok_or_else(|| {
                    OvsdbError::Tls(format!("No private key found in {}", key_path.display()))
                })?;
            info!("Using OVSDB client certificate {}", cert_path.display());
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| OvsdbError::Tls(format!("Invalid client certificate: {}", e)))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(OvsdbError::Tls(
                "client certificate and key must be configured together".to_string(),
            ))
        }
    };
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_ca_file() {
        let err = load_client_config(Path::new("/nonexistent/ca.pem"), None, None)
            .err()
            .unwrap();
        assert!(err.to_string().contains("/nonexistent/ca.pem"));
    }

    #[test]
    fn test_empty_ca_bundle() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not a certificate").unwrap();
        let err = load_client_config(file.path(), None, None).err().unwrap();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_malformed_certificate_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "-----BEGIN CERTIFICATE-----").unwrap();
        writeln!(file, "!!!! not base64 !!!!").unwrap();
        writeln!(file, "-----END CERTIFICATE-----").unwrap();
        let err = load_client_config(file.path(), None, None).err().unwrap();
        assert!(matches!(err, OvsdbError::Tls(_)));
        let message = err.to_string();
        assert!(message.contains("Malformed PEM"));
        assert!(message.contains(&file.path().display().to_string()));
    }
}
