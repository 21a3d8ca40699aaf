//! Root CA Certificate Generation Module
//!
//! Generates the self-signed root certificate that acts as the local trust anchor
//! for the gateway. Exactly one root exists per installation; it is installed into
//! the operating system (and browser) trust stores and signs the transport
//! certificate presented by the secure listener.
//!
//! ```text
//! Root CA (self-signed, pathlen=1) ← This module
//!   └── Transport certificate (signed by Root)
//! ```
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=1 (critical)
//! - **Subject Key Identifier**: hash of the public key, referenced by the leaf's AKID
//! - **Key Size**: RSA 2048-bit
//! - **Serial Number**: creation time in epoch milliseconds
//! - **Validity**: one day in the past until `validity_days - 1` days from now
//!
//! # Example
//! ```rust,no_run
//! # use anyhow::Result;
//! # use localgate::generate_root_ca::RsaRootCABuilder;
//! # fn example() -> Result<()> {
//! let (root_key, root_cert) = RsaRootCABuilder::new()
//!     .subject_common_name("localhost".to_string())
//!     .organization("Localgate".to_string())
//!     .organizational_unit("Localgate".to_string())
//!     .locality("Denver".to_string())
//!     .state("Colorado".to_string())
//!     .country("US".to_string())
//!     .email("trust@localgate.dev".to_string())
//!     .validity_days(7305)
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use anyhow::{anyhow, Result};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509NameBuilder, X509};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
pub(crate) const RSA_KEY_SIZE_DEFAULT: u32 = 2048;
pub(crate) const SECONDS_PER_DAY: i64 = 86_400;
const ROOT_CA_PATH_LENGTH: u32 = 1;
/// Twenty years, counting leap days
pub const ROOT_CA_VALIDITY_DAYS: u32 = 7305;

// ================= RSA Root CA Builder =================

/// Builder for the RSA key pair and self-signed root CA certificate
///
/// All distinguished name fields are written in the order C, ST, L, O, OU,
/// emailAddress, CN. The email address is the marker the trust-store installers
/// use to recognise roots issued by this application.
pub struct RsaRootCABuilder {
    subject_common_name: String,
    organization: String,
    organizational_unit: String,
    locality: String,
    state: String,
    country: String,
    email: String,
    validity_days: u32,
}

impl Default for RsaRootCABuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RsaRootCABuilder {
    /// Create a new builder with empty subject fields and a twenty year validity
    pub fn new() -> Self {
        Self {
            subject_common_name: String::new(),
            organization: String::new(),
            organizational_unit: String::new(),
            locality: String::new(),
            state: String::new(),
            country: String::new(),
            email: String::new(),
            validity_days: ROOT_CA_VALIDITY_DAYS,
        }
    }

    /// Set the common name (CN), normally the first host name served
    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    /// Set the organizational unit (OU) for the certificate
    pub fn organizational_unit(mut self, ou: String) -> Self {
        self.organizational_unit = ou;
        self
    }

    /// Set the locality (L) for the certificate
    pub fn locality(mut self, locality: String) -> Self {
        self.locality = locality;
        self
    }

    /// Set the state/province (ST) for the certificate
    pub fn state(mut self, state: String) -> Self {
        self.state = state;
        self
    }

    /// Set the country (C) for the certificate (2-letter ISO code)
    pub fn country(mut self, country: String) -> Self {
        self.country = country;
        self
    }

    /// Set the emailAddress attribute used as the identity marker
    pub fn email(mut self, email: String) -> Self {
        self.email = email;
        self
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Build the RSA key pair and self-signed root CA certificate
    ///
    /// # Errors
    /// Returns error if:
    /// - RSA key generation fails
    /// - A subject field is empty or rejected by OpenSSL
    /// - X.509 extension creation fails
    /// - Certificate signing fails
    ///
    /// Nothing is returned on failure, so there is never a partially built root.
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
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

        let name = SubjectFields {
            common_name: &self.subject_common_name,
            organization: &self.organization,
            organizational_unit: &self.organizational_unit,
            locality: &self.locality,
            state: &self.state,
            country: &self.country,
            email: &self.email,
        }
        .to_x509_name()?;

        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;
        builder
            .set_issuer_name(&name)
            .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

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

        let bc = BasicConstraints::new()
            .critical()
            .ca()
            .pathlen(ROOT_CA_PATH_LENGTH)
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(bc)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let ku = KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let skid = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(skid)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        Ok((private_key, builder.build()))
    }
}

// ================= Shared helpers =================

/// Subject distinguished name fields in the order they are written
pub(crate) struct SubjectFields<'a> {
    pub(crate) common_name: &'a str,
    pub(crate) organization: &'a str,
    pub(crate) organizational_unit: &'a str,
    pub(crate) locality: &'a str,
    pub(crate) state: &'a str,
    pub(crate) country: &'a str,
    pub(crate) email: &'a str,
}

impl SubjectFields<'_> {
    pub(crate) fn to_x509_name(&self) -> Result<X509Name> {
        let mut name_builder =
            X509NameBuilder::new().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        let entries = [
            (Nid::COUNTRYNAME, self.country, "country"),
            (Nid::STATEORPROVINCENAME, self.state, "state/province"),
            (Nid::LOCALITYNAME, self.locality, "locality"),
            (Nid::ORGANIZATIONNAME, self.organization, "organization"),
            (Nid::ORGANIZATIONALUNITNAME, self.organizational_unit, "organizational unit"),
            (Nid::PKCS9_EMAILADDRESS, self.email, "email address"),
            (Nid::COMMONNAME, self.common_name, "CN"),
        ];
        for (nid, value, label) in entries {
            if value.is_empty() {
                return Err(anyhow!("Certificate subject is missing the {} field", label));
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| anyhow!("Failed to set {}: {}", label, e))?;
        }
        Ok(name_builder.build())
    }
}

pub(crate) fn generate_rsa_key() -> Result<PKey<Private>> {
    let rsa = openssl::rsa::Rsa::generate(RSA_KEY_SIZE_DEFAULT)
        .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
    PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))
}

pub(crate) fn now_millis() -> Result<u128> {
    Ok(SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| anyhow!("System clock is before the epoch: {}", e))?
        .as_millis())
}

/// Serial number derived from the creation timestamp in milliseconds
pub(crate) fn timestamp_serial() -> Result<BigNum> {
    BigNum::from_dec_str(&now_millis()?.to_string())
        .map_err(|e| anyhow!("Failed to create serial number: {}", e))
}

/// Returns (not_before, not_after): backdated one day, expiring after `days - 1` days
pub(crate) fn validity_window(days: u32) -> Result<(Asn1Time, Asn1Time)> {
    let now = (now_millis()? / 1000) as i64;
    let not_before = Asn1Time::from_unix(now - SECONDS_PER_DAY)
        .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
    let lifetime = i64::from(days.saturating_sub(1)) * SECONDS_PER_DAY;
    let not_after = Asn1Time::from_unix(now + lifetime)
        .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
    Ok((not_before, not_after))
}

/// Whole days between now and `time`; negative once it has passed
pub(crate) fn days_until(time: &Asn1TimeRef) -> Result<i32> {
    let now = Asn1Time::days_from_now(0)?;
    let diff = now
        .diff(time)
        .map_err(|e| anyhow!("Failed to compare certificate times: {}", e))?;
    Ok(diff.days)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_root() -> (PKey<Private>, X509) {
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

    #[test]
    fn test_root_is_self_signed() {
        let (key, cert) = test_root();
        let subject = cert.subject_name().to_der().unwrap();
        let issuer = cert.issuer_name().to_der().unwrap();
        assert_eq!(subject, issuer);
        assert!(cert.verify(&key).unwrap());
    }

    #[test]
    fn test_root_key_is_2048_bits() {
        let (key, _) = test_root();
        assert_eq!(key.bits(), 2048);
    }

    #[test]
    fn test_root_carries_subject_key_identifier() {
        let (_, cert) = test_root();
        assert!(cert.subject_key_id().is_some());
    }

    #[test]
    fn test_root_validity_is_about_twenty_years() {
        let (_, cert) = test_root();
        let days = days_until(cert.not_after()).unwrap();
        assert!(days >= 7302 && days <= 7305, "unexpected lifetime {}", days);
    }

    #[test]
    fn test_missing_subject_field_fails() {
        let result = RsaRootCABuilder::new()
            .subject_common_name("localhost".to_string())
            .build();
        assert!(result.is_err());
    }
}
