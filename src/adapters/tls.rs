//! TLS 1.3 server configuration with a per-SNI credential table.
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::Arc,
};

use rustls::{
    crypto::{CryptoProvider, aws_lc_rs},
    pki_types::{CertificateDer, PrivateKeyDer},
    server::ResolvesServerCertUsingSni,
    sign::CertifiedKey,
    version::TLS13,
};
use thiserror::Error;

use crate::config::TlsConfig;

/// The only application protocol offered during ALPN.
pub const ALPN_H2: &[u8] = b"h2";

/// Errors raised while building the TLS configuration
#[derive(Error, Debug)]
pub enum TlsSetupError {
    #[error("failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in '{path}'")]
    NoCertificates { path: PathBuf },

    #[error("no private key found in '{path}'")]
    NoPrivateKey { path: PathBuf },

    #[error("no TLS credentials configured")]
    NoCredentials,

    #[error("credential '{name}' rejected: {source}")]
    Credential {
        name: String,
        #[source]
        source: rustls::Error,
    },

    #[error("TLS configuration failed: {0}")]
    Rustls(#[from] rustls::Error),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsSetupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsSetupError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn io_error(path: &Path) -> impl Fn(std::io::Error) -> TlsSetupError + '_ {
    move |source| TlsSetupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Path of the certificate chain for credential `name`.
pub fn certificate_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}-cert.pem"))
}

/// Path of the private key for credential `name`.
pub fn private_key_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}-privkey.pem"))
}

/// Load `<dir>/<name>-cert.pem` and `<dir>/<name>-privkey.pem`.
pub fn load_credential(
    dir: &Path,
    name: &str,
    provider: &CryptoProvider,
) -> Result<CertifiedKey, TlsSetupError> {
    let cert_path = certificate_path(dir, name);
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut open(&cert_path)?)
        .collect::<Result<_, _>>()
        .map_err(io_error(&cert_path))?;
    if chain.is_empty() {
        return Err(TlsSetupError::NoCertificates { path: cert_path });
    }

    let key_path = private_key_path(dir, name);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut open(&key_path)?)
        .map_err(io_error(&key_path))?
        .ok_or_else(|| TlsSetupError::NoPrivateKey {
            path: key_path.clone(),
        })?;

    let signing_key = provider
        .key_provider
        .load_private_key(key)
        .map_err(|source| TlsSetupError::Credential {
            name: name.to_string(),
            source,
        })?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Build a TLS 1.3-only server configuration offering ALPN `h2`, resolving
/// certificates by SNI from the configured credential table.
pub fn server_tls_config(tls: &TlsConfig) -> Result<Arc<rustls::ServerConfig>, TlsSetupError> {
    if tls.credentials.is_empty() {
        return Err(TlsSetupError::NoCredentials);
    }

    let provider = Arc::new(aws_lc_rs::default_provider());
    let dir = Path::new(&tls.certificate_dir);

    let mut resolver = ResolvesServerCertUsingSni::new();
    for name in &tls.credentials {
        let credential = load_credential(dir, name, &provider)?;
        resolver
            .add(name, credential)
            .map_err(|source| TlsSetupError::Credential {
                name: name.clone(),
                source,
            })?;
        tracing::debug!(credential = %name, "loaded TLS credential");
    }

    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&TLS13])?
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(resolver));
    config.alpn_protocols = vec![ALPN_H2.to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_credential(dir: &Path, name: &str) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        std::fs::write(certificate_path(dir, name), cert.cert.pem()).unwrap();
        std::fs::write(private_key_path(dir, name), cert.signing_key.serialize_pem()).unwrap();
    }

    fn tls_config(dir: &TempDir, credentials: &[&str]) -> TlsConfig {
        TlsConfig {
            certificate_dir: dir.path().to_string_lossy().into_owned(),
            credentials: credentials.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_builds_config_for_every_credential() {
        let dir = TempDir::new().unwrap();
        write_credential(dir.path(), "localhost");
        write_credential(dir.path(), "api.example");

        let config = server_tls_config(&tls_config(&dir, &["localhost", "api.example"])).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_missing_files_are_reported() {
        let dir = TempDir::new().unwrap();
        let error = server_tls_config(&tls_config(&dir, &["localhost"])).unwrap_err();
        assert!(matches!(error, TlsSetupError::Io { .. }));
        assert!(error.to_string().contains("localhost-cert.pem"));
    }

    #[test]
    fn test_certificate_must_match_name() {
        let dir = TempDir::new().unwrap();
        write_credential(dir.path(), "localhost");
        // reuse the localhost pair under another name
        std::fs::copy(
            certificate_path(dir.path(), "localhost"),
            certificate_path(dir.path(), "other.example"),
        )
        .unwrap();
        std::fs::copy(
            private_key_path(dir.path(), "localhost"),
            private_key_path(dir.path(), "other.example"),
        )
        .unwrap();

        let error = server_tls_config(&tls_config(&dir, &["other.example"])).unwrap_err();
        assert!(matches!(error, TlsSetupError::Credential { .. }));
    }

    #[test]
    fn test_no_credentials() {
        assert!(matches!(
            server_tls_config(&TlsConfig::default()),
            Err(TlsSetupError::NoCredentials)
        ));
    }
}
