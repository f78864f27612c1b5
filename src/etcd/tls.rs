//! Client TLS credential loading.

use std::path::{Path, PathBuf};

use tonic::transport::{Certificate, ClientTlsConfig, Identity};

#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} contains no PEM certificate")]
    NoCertificate { path: PathBuf },

    #[error("{path} contains no PEM private key")]
    NoPrivateKey { path: PathBuf },

    #[error("{path} is not valid PEM: {reason}")]
    InvalidPem { path: PathBuf, reason: String },
}

fn read(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn require_certificates(path: &Path, pem: &[u8]) -> Result<(), TlsError> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::InvalidPem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

fn require_private_key(path: &Path, pem: &[u8]) -> Result<(), TlsError> {
    match rustls_pemfile::private_key(&mut &pem[..]) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(TlsError::NoPrivateKey {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(TlsError::InvalidPem {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

/// Load a mutual-TLS client configuration for etcd.
///
/// Each file is read and checked for at least one PEM block of the right
/// kind before being handed to tonic, so a misconfigured mount fails at
/// startup instead of on the first handshake.
pub fn load_tls_config(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
    ca_path: impl AsRef<Path>,
) -> Result<ClientTlsConfig, TlsError> {
    let (cert_path, key_path, ca_path) = (cert_path.as_ref(), key_path.as_ref(), ca_path.as_ref());

    let cert_pem = read(cert_path)?;
    require_certificates(cert_path, &cert_pem)?;

    let key_pem = read(key_path)?;
    require_private_key(key_path, &key_pem)?;

    let ca_pem = read(ca_path)?;
    require_certificates(ca_path, &ca_pem)?;

    Ok(ClientTlsConfig::new()
        .ca_certificate(Certificate::from_pem(ca_pem))
        .identity(Identity::from_pem(cert_pem, key_pem)))
}
