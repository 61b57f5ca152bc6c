use std::io::BufReader;

use anyhow::Context as _;
use camino::Utf8Path;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};

pub(crate) fn build_server_config(
    certificate_file: &Utf8Path,
    private_key_file: &Utf8Path,
) -> anyhow::Result<rustls::ServerConfig> {
    let certificates = load_certificates(certificate_file)
        .with_context(|| format!("couldn't load certificates from {certificate_file}"))?;

    let private_key =
        load_private_key(private_key_file).with_context(|| format!("couldn't load private key from {private_key_file}"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)
        .context("invalid certificate or key")?;

    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(config)
}

fn load_certificates(path: &Utf8Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let certificates = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;

    anyhow::ensure!(!certificates.is_empty(), "no certificate found");

    Ok(certificates)
}

fn load_private_key(path: &Utf8Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)?.context("no private key found")
}
