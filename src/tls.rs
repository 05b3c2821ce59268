use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

/// Build a TLS acceptor from PEM files. Both paths or neither; with neither
/// the server speaks plaintext only.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (Path::new(c), Path::new(k)),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both QUORUM_TLS_CERT and QUORUM_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut open_pem(cert_path)?).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("no certificates found in {}", cert_path.display()),
        ));
    }

    let key = rustls_pemfile::private_key(&mut open_pem(key_path)?)?.ok_or_else(|| {
        io::Error::new(
            ErrorKind::InvalidInput,
            format!("no private key found in {}", key_path.display()),
        )
    })?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::debug!("loaded TLS certificate from {}", cert_path.display());
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn open_pem(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{}: {e}", path.display())))
}
