use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Build the acceptor for the configured PEM pair; `None` serves plaintext only.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    match (cert_path, key_path) {
        (None, None) => Ok(None),
        (Some(cert), Some(key)) => {
            let config = server_config(cert, key)?;
            Ok(Some(TlsAcceptor::from(Arc::new(config))))
        }
        _ => Err(invalid(
            "both SHAREIT_TLS_CERT and SHAREIT_TLS_KEY must be set, or neither",
        )),
    }
}

fn server_config(cert_path: &str, key_path: &str) -> io::Result<ServerConfig> {
    let mut certs = BufReader::new(File::open(cert_path)?);
    let chain = rustls_pemfile::certs(&mut certs).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(invalid(format!("no certificates in {cert_path}")));
    }

    let mut keys = BufReader::new(File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut keys)?
        .ok_or_else(|| invalid(format!("no private key in {key_path}")))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];
    tracing::info!("TLS certificate loaded from {cert_path}");
    Ok(config)
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_without_paths() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        let err = load_tls_acceptor(Some("cert.pem"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(load_tls_acceptor(None, Some("key.pem")).is_err());
    }

    #[test]
    fn missing_files_surface_as_io_errors() {
        let dir = std::env::temp_dir().join("shareit_test_tls_missing");
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        let err = load_tls_acceptor(cert.to_str(), key.to_str()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let dir = std::env::temp_dir().join("shareit_test_tls_empty");
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        std::fs::write(&cert, "").unwrap();
        let err = load_tls_acceptor(cert.to_str(), cert.to_str()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
