//! Hot-reloadable TLS context for the secure listener.
//!
//! The listener is configured once with a [`ReloadableCertResolver`]. Each new
//! handshake asks the resolver for the current certificate, so swapping the
//! certified key takes effect on the next connection without rebinding the
//! socket. Handshakes already in progress hold their own `Arc` and finish with
//! the material they started with.

use anyhow::{anyhow, Result};
use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::info;

use crate::key_material::KeyMaterial;

#[derive(Debug)]
pub struct ReloadableCertResolver {
    current: RwLock<Arc<CertifiedKey>>,
    generation: AtomicU64,
}

impl ReloadableCertResolver {
    pub fn new(material: &KeyMaterial) -> Result<Self> {
        Ok(Self {
            current: RwLock::new(Arc::new(certified_key(material)?)),
            generation: AtomicU64::new(0),
        })
    }

    /// Replace the presented certificate; on error the previous one stays active
    pub fn swap(&self, material: &KeyMaterial) -> Result<()> {
        let next = Arc::new(certified_key(material)?);
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        *guard = next;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!("Transport certificate reloaded (generation {})", generation);
        Ok(())
    }

    pub fn current(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of swaps since construction
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl ResolvesServerCert for ReloadableCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current())
    }
}

/// Convert OpenSSL key material into the rustls representation
pub fn certified_key(material: &KeyMaterial) -> Result<CertifiedKey> {
    let mut certs = Vec::new();
    for cert in material.full_chain() {
        let der = cert
            .to_der()
            .map_err(|e| anyhow!("Failed to encode certificate: {}", e))?;
        certs.push(CertificateDer::from(der));
    }

    let key_der = material
        .private_key()
        .private_key_to_pkcs8()
        .map_err(|e| anyhow!("Failed to encode private key: {}", e))?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));
    let signing_key =
        any_supported_type(&key).map_err(|e| anyhow!("Unsupported private key: {}", e))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

pub fn server_config(resolver: Arc<ReloadableCertResolver>) -> Result<Arc<ServerConfig>> {
    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| anyhow!("Failed to select TLS versions: {}", e))?
            .with_no_client_auth()
            .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
