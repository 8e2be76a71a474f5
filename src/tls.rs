use anyhow::{Context, Result, bail};
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio_rustls::TlsAcceptor;

use crate::config::TlsConfig;

/// Builds the acceptor a pair's WebSocket listener uses to serve `wss://`.
pub fn load_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let cert_chain = read_cert_chain(Path::new(&tls_config.cert_file))?;
    let key = read_private_key(Path::new(&tls_config.key_file))?;

    let mut server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Certificate and private key do not form a usable TLS config")?;
    // The upgrade is an HTTP/1.1 request.
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "certificate")?;
    let chain = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Malformed PEM in certificate file {}", path.display()))?;
    if chain.is_empty() {
        bail!("No certificates found in {}", path.display());
    }
    Ok(chain)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path, "private key")?;
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => bail!("No private key found in {}", path.display()),
        Err(e) => Err(e)
            .with_context(|| format!("Malformed PEM in private key file {}", path.display())),
    }
}

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .with_context(|| format!("Failed to open {what} file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        std::env::temp_dir()
            .join(format!("ws-tcp-tunnel-{}-{name}", std::process::id()))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn missing_certificate_is_reported() {
        let config = TlsConfig {
            cert_file: temp_path("absent-cert.pem"),
            key_file: temp_path("absent-key.pem"),
        };
        let err = load_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("Failed to open certificate file"));
    }

    #[test]
    fn empty_certificate_file_is_rejected() {
        let cert_file = temp_path("empty-cert.pem");
        let key_file = temp_path("empty-key.pem");
        std::fs::write(&cert_file, "").unwrap();
        std::fs::write(&key_file, "").unwrap();

        let config = TlsConfig {
            cert_file: cert_file.clone(),
            key_file: key_file.clone(),
        };
        let err = load_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("No certificates found"));

        let _ = std::fs::remove_file(cert_file);
        let _ = std::fs::remove_file(key_file);
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let cert_file = temp_path("stub-cert.pem");
        let key_file = temp_path("keyless.pem");
        std::fs::write(
            &cert_file,
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        std::fs::write(&key_file, "no key here\n").unwrap();

        let config = TlsConfig {
            cert_file: cert_file.clone(),
            key_file: key_file.clone(),
        };
        let err = load_tls_acceptor(&config).err().unwrap();
        assert!(err.to_string().contains("No private key found"));

        let _ = std::fs::remove_file(cert_file);
        let _ = std::fs::remove_file(key_file);
    }
}
