use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use openssl::nid::Nid;
use openssl::x509::X509;
use rustls::{Certificate, ClientConfig, OwnedTrustAnchor, PrivateKey, RootCertStore, ServerConfig};
use rustls_pemfile::Item;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// The serving identity: acceptor for inbound TLS plus the name we
/// advertise, taken from the certificate subject.
pub struct ServerIdentity {
    pub acceptor: TlsAcceptor,
    pub domain: String,
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).with_context(|| format!("Failed to open certificate: {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse certificate: {:?}", path))?;
    if certs.is_empty() {
        return Err(anyhow!("No certificate found in {:?}", path));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path).with_context(|| format!("Failed to open private key: {:?}", path))?;
    let items = rustls_pemfile::read_all(&mut BufReader::new(file))
        .with_context(|| format!("Failed to parse private key: {:?}", path))?;

    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| anyhow!("No private key found in {:?}", path))
}

/// Extracts the subject common name of a DER encoded certificate.
pub fn common_name(der: &[u8]) -> Result<String> {
    let cert = X509::from_der(der).context("Failed to decode leaf certificate")?;
    let entry = cert
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .ok_or_else(|| anyhow!("Certificate subject has no common name"))?;
    let data = entry.data();
    if data.as_slice().contains(&0) {
        return Err(anyhow!("Certificate common name contains a NUL byte"));
    }
    let name = data.as_utf8().context("Certificate common name is not valid UTF-8")?;
    Ok(name.to_string())
}

impl ServerIdentity {
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_chain = load_certs(cert_path)?;
        let private_key = load_private_key(key_path)?;
        let domain = common_name(&cert_chain[0].0)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| anyhow!("Failed to build TLS config: {}", e))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            domain,
        })
    }
}

/// Connector for the upstream leg, verifying against the Mozilla roots.
pub fn upstream_connector() -> TlsConnector {
    let mut root_store = RootCertStore::empty();
    root_store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(ta.subject, ta.spki, ta.name_constraints)
    }));

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}
