//! Transport (leaf) Certificate Generation Module
//!
//! Builds the TLS certificate presented by the secure websocket listener. It is
//! signed directly by the local root CA:
//!
//! **Certificate Chain**: Root CA → Transport certificate
//!
//! # X.509 Extensions
//! - **Authority Key Identifier**: key id of the signing root
//! - **Basic Constraints**: `CA=false` (critical)
//! - **Key Usage**: `digitalSignature`, `keyEncipherment` (critical)
//! - **Extended Key Usage**: `serverAuth`, `clientAuth`
//! - **Subject Alternative Name**: every host name, dotted quads as IP entries and
//!   everything else as DNS entries
//! - **Subject Key Identifier**
//!
//! Validity defaults to 825 days, the longest lifetime browsers accept for
//! certificates issued by a locally trusted root.

use anyhow::{anyhow, Result};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage,
    SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Ref, X509};

use crate::generate_root_ca::{
    generate_rsa_key, timestamp_serial, validity_window, SubjectFields, X509_VERSION_3,
};

pub const TRANSPORT_CERT_VALIDITY_DAYS: u32 = 825;

// ================= RSA Transport Certificate Builder =================

/// Builder for the RSA key pair and transport certificate signed by the root CA
///
/// The common name is the first entry of `host_names`; every entry also lands in
/// the subject alternative name extension.
pub struct RsaTransportCertBuilder<'a> {
    host_names: Vec<String>,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    email: String,
    validity_days: u32,
    signing_key: &'a PKeyRef<Private>,
    signing_cert: &'a X509Ref,
}

impl<'a> RsaTransportCertBuilder<'a> {
    /// Create a builder that signs with the given root key and certificate
    pub fn new(root_key: &'a PKeyRef<Private>, root_cert: &'a X509Ref) -> Self {
        Self {
            host_names: Vec::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            email: String::new(),
            validity_days: TRANSPORT_CERT_VALIDITY_DAYS,
            signing_key: root_key,
            signing_cert: root_cert,
        }
    }

    /// Set the host names served with this certificate
    pub fn host_names(mut self, hosts: Vec<String>) -> Self {
        self.host_names = hosts;
        self
    }

    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    pub fn email(mut self, email: String) -> Self {
        self.email = email;
        self
    }

    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Build the key pair and the root-signed transport certificate
    ///
    /// # Errors
    /// Fails when no host name was supplied, or on any OpenSSL key generation,
    /// extension or signing error.
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        let common_name = self
            .host_names
            .first()
            .ok_or_else(|| anyhow!("At least one host name is required"))?;

        let private_key = generate_rsa_key()?;

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;

        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        let serial = timestamp_serial()?.to_asn1_integer()?;
        builder
            .set_serial_number(&serial)
            .map_err(|e| anyhow!("Failed to set serial number: {}", e))?;

        let subject_name = SubjectFields {
            common_name,
            organization: &self.organization,
            organizational_unit: &self.organizational_unit,
            locality: &self.locality,
            state: &self.state,
            country: &self.country,
            email: &self.email,
        }
        .to_x509_name()?;

        builder
            .set_subject_name(&subject_name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(self.signing_cert.subject_name())
            .map_err(|e| anyhow!("Failed to set issuer from root CA: {}", e))?;

        let (not_before, not_after) = validity_window(self.validity_days)?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let akid = AuthorityKeyIdentifier::new()
            .keyid(false)
            .issuer(false)
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build AuthorityKeyIdentifier: {}", e))?;
        builder
            .append_extension(akid)
            .map_err(|e| anyhow!("Failed to add AuthorityKeyIdentifier: {}", e))?;

        let bc = BasicConstraints::new()
            .critical()
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(bc)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let ku = KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let eku = ExtendedKeyUsage::new()
            .server_auth()
            .client_auth()
            .build()
            .map_err(|e| anyhow!("Failed to build ExtendedKeyUsage: {}", e))?;
        builder
            .append_extension(eku)
            .map_err(|e| anyhow!("Failed to add ExtendedKeyUsage: {}", e))?;

        let mut san = SubjectAlternativeName::new();
        for host in &self.host_names {
            if is_ipv4_literal(host) {
                san.ip(host);
            } else {
                san.dns(host);
            }
        }
        let san = san
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectAlternativeName: {}", e))?;
        builder
            .append_extension(san)
            .map_err(|e| anyhow!("Failed to add SubjectAlternativeName: {}", e))?;

        let skid = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(self.signing_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(skid)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(self.signing_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        Ok((private_key, builder.build()))
    }
}

/// True for exactly four dot separated decimal octets, each 0-255
pub fn is_ipv4_literal(host: &str) -> bool {
    let parts: Vec<&str> = host.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|part| {
            !part.is_empty()
                && part.len() <= 3
                && part.bytes().all(|b| b.is_ascii_digit())
                && part.parse::<u16>().map(|v| v <= 255).unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_root_ca::RsaRootCABuilder;

    fn root() -> (PKey<Private>, X509) {
        RsaRootCABuilder::new()
            .subject_common_name("localhost".to_string())
            .organization("Localgate".to_string())
            .organizational_unit("Localgate".to_string())
            .locality("Denver".to_string())
            .state("Colorado".to_string())
            .country("US".to_string())
            .email("trust@localgate.dev".to_string())
            .build()
            .unwrap()
    }

    fn leaf(root_key: &PKey<Private>, root_cert: &X509, hosts: &[&str]) -> X509 {
        RsaTransportCertBuilder::new(root_key, root_cert)
            .host_names(hosts.iter().map(|h| h.to_string()).collect())
            .organization("Localgate".to_string())
            .organizational_unit("Localgate".to_string())
            .locality("Denver".to_string())
            .state("Colorado".to_string())
            .country("US".to_string())
            .email("trust@localgate.dev".to_string())
            .build()
            .unwrap()
            .1
    }

    #[test]
    fn test_ipv4_classification() {
        assert!(is_ipv4_literal("10.0.0.5"));
        assert!(is_ipv4_literal("255.255.255.255"));
        assert!(!is_ipv4_literal("256.0.0.1"));
        assert!(!is_ipv4_literal("10.0.0"));
        assert!(!is_ipv4_literal("10.0.0.5.1"));
        assert!(!is_ipv4_literal("printer.local"));
        assert!(!is_ipv4_literal("1.2.3.-4"));
        assert!(!is_ipv4_literal("1..3.4"));
    }

    #[test]
    fn test_san_splits_ip_and_dns_entries() {
        let (key, cert) = root();
        let leaf = leaf(&key, &cert, &["10.0.0.5", "printer.local"]);
        let names = leaf.subject_alt_names().unwrap();

        let ips: Vec<Vec<u8>> = names
            .iter()
            .filter_map(|n| n.ipaddress().map(|ip| ip.to_vec()))
            .collect();
        let dns: Vec<String> = names
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();

        assert_eq!(ips, vec![vec![10, 0, 0, 5]]);
        assert_eq!(dns, vec!["printer.local".to_string()]);
    }

    #[test]
    fn test_leaf_is_signed_by_root() {
        let (key, cert) = root();
        let leaf = leaf(&key, &cert, &["localhost"]);
        let root_public = cert.public_key().unwrap();
        assert!(leaf.verify(&root_public).unwrap());
        assert_eq!(
            leaf.issuer_name().to_der().unwrap(),
            cert.subject_name().to_der().unwrap()
        );
        assert_eq!(
            leaf.authority_key_id().unwrap().as_slice(),
            cert.subject_key_id().unwrap().as_slice()
        );
    }

    #[test]
    fn test_empty_host_list_fails() {
        let (key, cert) = root();
        let result = RsaTransportCertBuilder::new(&key, &cert)
            .organization("Localgate".to_string())
            .build();
        assert!(result.is_err());
    }
}
