//! Root and transport certificate factory
//!
//! [`CertificateChainBuilder`] wraps the two RSA builders with the fixed
//! organizational identity of this application and hands back [`KeyMaterial`]
//! ready to be persisted. Both certificates get their own 2048-bit key and are
//! signed with SHA-256.
//!
//! ```text
//! create_root_certificate(hosts)          -> KeyMaterial { role: Ca }
//! create_leaf_certificate(&root, hosts)   -> KeyMaterial { role: Leaf, chain: [root] }
//! ```
//!
//! An empty host list falls back to [`DEFAULT_HOST_NAMES`].

use anyhow::{anyhow, Result};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Ref, X509StoreContext, X509};
use secrecy::SecretString;

use crate::generate_root_ca::{RsaRootCABuilder, ROOT_CA_VALIDITY_DAYS};
use crate::generate_transport_cert::{RsaTransportCertBuilder, TRANSPORT_CERT_VALIDITY_DAYS};
use crate::key_material::{copy_secret, KeyMaterial, Role};

pub const DEFAULT_HOST_NAMES: [&str; 2] = ["localhost", "localhost.localgate.dev"];

/// Organizational subject fields stamped on every certificate this application issues
#[derive(Debug, Clone)]
pub struct CertificateIdentity {
    pub organization: String,
    pub locality: String,
    pub state: String,
    pub country: String,
    /// Identity marker used to find earlier installs in the trust stores
    pub email: String,
}

impl Default for CertificateIdentity {
    fn default() -> Self {
        Self {
            organization: "Localgate".to_string(),
            locality: "Denver".to_string(),
            state: "Colorado".to_string(),
            country: "US".to_string(),
            email: "trust@localgate.dev".to_string(),
        }
    }
}

pub struct CertificateChainBuilder {
    identity: CertificateIdentity,
    password: SecretString,
}

impl CertificateChainBuilder {
    /// Builder using the default identity; `password` protects both keystores
    pub fn new(password: SecretString) -> Self {
        Self::with_identity(CertificateIdentity::default(), password)
    }

    pub fn with_identity(identity: CertificateIdentity, password: SecretString) -> Self {
        Self { identity, password }
    }

    pub fn identity(&self) -> &CertificateIdentity {
        &self.identity
    }

    /// Self-signed root named after the first host
    pub fn create_root_certificate(&self, host_names: &[String]) -> Result<KeyMaterial> {
        let hosts = normalize_hosts(host_names);
        let (key, cert) = RsaRootCABuilder::new()
            .subject_common_name(hosts[0].clone())
            .organization(self.identity.organization.clone())
            .organizational_unit(self.identity.organization.clone())
            .locality(self.identity.locality.clone())
            .state(self.identity.state.clone())
            .country(self.identity.country.clone())
            .email(self.identity.email.clone())
            .validity_days(ROOT_CA_VALIDITY_DAYS)
            .build()?;
        Ok(KeyMaterial::new(Role::Ca, key, cert, copy_secret(&self.password)))
    }

    /// Transport certificate signed by `root`, valid for every host in `host_names`
    pub fn create_leaf_certificate(
        &self,
        root: &KeyMaterial,
        host_names: &[String],
    ) -> Result<KeyMaterial> {
        if root.role() != Role::Ca {
            return Err(anyhow!("Transport certificates must be signed by the root CA"));
        }
        let hosts = normalize_hosts(host_names);
        let (key, cert) = RsaTransportCertBuilder::new(root.private_key(), root.certificate())
            .host_names(hosts)
            .organization(self.identity.organization.clone())
            .organizational_unit(self.identity.organization.clone())
            .locality(self.identity.locality.clone())
            .state(self.identity.state.clone())
            .country(self.identity.country.clone())
            .email(self.identity.email.clone())
            .validity_days(TRANSPORT_CERT_VALIDITY_DAYS)
            .build()?;
        Ok(
            KeyMaterial::new(Role::Leaf, key, cert, copy_secret(&self.password))
                .with_chain(vec![root.certificate().clone()]),
        )
    }
}

/// Trim, drop blanks, fall back to the default pair when nothing is left
pub fn normalize_hosts(host_names: &[String]) -> Vec<String> {
    let hosts: Vec<String> = host_names
        .iter()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .collect();
    if hosts.is_empty() {
        DEFAULT_HOST_NAMES.iter().map(|h| h.to_string()).collect()
    } else {
        hosts
    }
}

/// Split a semicolon delimited host list as accepted on the command line
pub fn parse_host_list(list: &str) -> Vec<String> {
    normalize_hosts(&list.split(';').map(str::to_string).collect::<Vec<_>>())
}

/// Validate `leaf` (plus optional intermediates) against a single trusted root
pub fn chains_to(leaf: &X509Ref, intermediates: &[X509], root: &X509Ref) -> Result<bool> {
    let mut store = X509StoreBuilder::new()?;
    store
        .add_cert(root.to_owned())
        .map_err(|e| anyhow!("Failed to add trust anchor: {}", e))?;
    let store = store.build();

    let mut chain = Stack::new()?;
    for cert in intermediates {
        chain.push(cert.clone())?;
    }

    let mut context = X509StoreContext::new()?;
    let valid = context
        .init(&store, leaf, &chain, |ctx| ctx.verify_cert())
        .map_err(|e| anyhow!("Chain validation could not run: {}", e))?;
    Ok(valid)
}
