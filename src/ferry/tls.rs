use std::{fs, path::Path, sync::Arc};

use anyhow::Context;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use crate::ferry::files;

/// Makes sure a certificate/key pair exists at the given paths.
pub trait CertificateProvider: Send + Sync {
    /// Returns true when new material was written.
    fn ensure(&self, cert_file: &Path, key_file: &Path) -> anyhow::Result<bool>;
}

/// Generates a self-signed `localhost` certificate when either file is missing.
#[derive(Debug, Clone)]
pub struct SelfSignedCertificates {
    pub subject_alt_names: Vec<String>,
}

impl Default for SelfSignedCertificates {
    fn default() -> Self {
        Self {
            subject_alt_names: vec!["localhost".to_string()],
        }
    }
}

impl CertificateProvider for SelfSignedCertificates {
    fn ensure(&self, cert_file: &Path, key_file: &Path) -> anyhow::Result<bool> {
        if cert_file.is_file() && key_file.is_file() {
            return Ok(false);
        }

        let rcgen::CertifiedKey { cert, signing_key } =
            generate_simple_self_signed(self.subject_alt_names.clone())
                .context("tls: generate self-signed certificate")?;

        for p in [cert_file, key_file] {
            files::ensure_parent_dir(p).with_context(|| format!("tls: mkdir for {}", p.display()))?;
        }

        fs::write(cert_file, cert.pem())
            .with_context(|| format!("tls: write {}", cert_file.display()))?;
        files::write_private(key_file, signing_key.serialize_pem().as_bytes())
            .with_context(|| format!("tls: write {}", key_file.display()))?;
        Ok(true)
    }
}

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("tls: parse {}", path.display()))?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let key = rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("tls: parse {}", path.display()))?;
    let Some(k) = key else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(k)
}

pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<rustls::ServerConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let cfg = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("tls: protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("tls: certificate does not match key")?;
    Ok(cfg)
}

pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> anyhow::Result<TlsAcceptor> {
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;
    let cfg = server_config(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(cfg)))
}
