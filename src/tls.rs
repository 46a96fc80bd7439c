use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// TLS for the staff console. Both paths or neither; neither means plaintext.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => return Err(invalid("set both PARKKING_TLS_CERT and PARKKING_TLS_KEY, or neither")),
    };

    let chain = read_cert_chain(cert_path)?;
    let key = read_private_key(key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| invalid(format!("{cert_path}: {e}")))?;
    config.alpn_protocols = vec![b"postgresql".to_vec()];

    tracing::info!(cert = cert_path, "console TLS enabled");
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(ErrorKind::InvalidInput, msg.into())
}

fn open(path: &str) -> io::Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| io::Error::new(e.kind(), format!("{path}: {e}")))
}

fn read_cert_chain(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut open(path)?).collect::<Result<Vec<_>, _>>()?;
    if chain.is_empty() {
        return Err(invalid(format!("{path}: no certificates")));
    }
    Ok(chain)
}

fn read_private_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)?
        .ok_or_else(|| invalid(format!("{path}: no private key")))
}
