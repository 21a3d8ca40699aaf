//! Caller identity certificates
//!
//! Web pages identify themselves once per connection by sending a PEM
//! certificate, optionally followed by an intermediate after a
//! `--START INTERMEDIATE CERT--` marker. The certificate is trusted when it
//! chains to the configured signing root and is currently valid. Callers that
//! never send one are represented by [`IdentityCertificate::unknown`].
//!
//! Allow and block lists store identities as tab separated records:
//!
//! ```text
//! <sha1 fingerprint>\t<common name>\t<organization>\t<valid from>\t<valid to>\t<trusted>
//! ```

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::hash::MessageDigest;
use openssl::sign::Verifier;
use openssl::x509::{X509Ref, X509};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::certificate_chain_builder::chains_to;
use crate::key_material::{subject_common_name, subject_organization};

pub const INTERMEDIATE_MARKER: &str = "--START INTERMEDIATE CERT--";
pub const UNKNOWN_FINGERPRINT: &str = "UNKNOWN REQUEST";
const UNKNOWN_COMMON_NAME: &str = "An anonymous request";
const UNKNOWN_ORGANIZATION: &str = "Unknown";
const ZERO_DATE: &str = "0000-00-00 00:00:00";
const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Digest used for request signatures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureAlgorithm {
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

impl SignatureAlgorithm {
    fn digest(self) -> MessageDigest {
        match self {
            SignatureAlgorithm::Sha1 => MessageDigest::sha1(),
            SignatureAlgorithm::Sha256 => MessageDigest::sha256(),
            SignatureAlgorithm::Sha512 => MessageDigest::sha512(),
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().replace('-', "").as_str() {
            "SHA1" => Ok(SignatureAlgorithm::Sha1),
            "SHA256" => Ok(SignatureAlgorithm::Sha256),
            "SHA512" => Ok(SignatureAlgorithm::Sha512),
            other => Err(anyhow!("Unsupported signature algorithm {}", other)),
        }
    }
}

#[derive(Clone)]
pub struct IdentityCertificate {
    fingerprint: String,
    common_name: String,
    organization: String,
    valid_from: String,
    valid_to: String,
    trusted: bool,
    certificate: Option<X509>,
}

impl IdentityCertificate {
    /// Sentinel for callers that never presented a certificate
    pub fn unknown() -> Self {
        Self {
            fingerprint: UNKNOWN_FINGERPRINT.to_string(),
            common_name: UNKNOWN_COMMON_NAME.to_string(),
            organization: UNKNOWN_ORGANIZATION.to_string(),
            valid_from: ZERO_DATE.to_string(),
            valid_to: ZERO_DATE.to_string(),
            trusted: false,
            certificate: None,
        }
    }

    /// Parse a caller certificate and check it against `trusted_root`
    ///
    /// Without a root nothing is trusted, but the identity can still be
    /// remembered by fingerprint.
    pub fn from_pem(text: &str, trusted_root: Option<&X509Ref>) -> Result<Self> {
        let mut parts = text.splitn(2, INTERMEDIATE_MARKER);
        let certificate = decode_certificate(parts.next().unwrap_or_default())
            .context("Failed to parse identity certificate")?;
        let intermediates = match parts.next() {
            Some(pem) if !pem.trim().is_empty() => {
                vec![decode_certificate(pem).context("Failed to parse intermediate certificate")?]
            }
            _ => Vec::new(),
        };

        let trusted = match trusted_root {
            Some(root) => chains_to(&certificate, &intermediates, root).unwrap_or_else(|e| {
                debug!("Identity chain validation failed: {:#}", e);
                false
            }),
            None => false,
        };

        Ok(Self {
            fingerprint: fingerprint(&certificate)?,
            common_name: subject_common_name(&certificate).unwrap_or_default(),
            organization: subject_organization(&certificate).unwrap_or_default(),
            valid_from: format_time(certificate.not_before())?,
            valid_to: format_time(certificate.not_after())?,
            trusted,
            certificate: Some(certificate),
        })
    }

    /// Rebuild a listing entry from an allow/block file line
    pub fn from_data_record(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 6 || fields[0].is_empty() {
            return None;
        }
        Some(Self {
            fingerprint: fields[0].to_string(),
            common_name: fields[1].to_string(),
            organization: fields[2].to_string(),
            valid_from: fields[3].to_string(),
            valid_to: fields[4].to_string(),
            trusted: fields[5].trim() == "true",
            certificate: None,
        })
    }

    pub fn data_record(&self) -> String {
        [
            self.fingerprint.as_str(),
            &self.common_name,
            &self.organization,
            &self.valid_from,
            &self.valid_to,
            if self.trusted { "true" } else { "false" },
        ]
        .join("\t")
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    pub fn organization(&self) -> &str {
        &self.organization
    }

    pub fn valid_from(&self) -> &str {
        &self.valid_from
    }

    pub fn valid_to(&self) -> &str {
        &self.valid_to
    }

    pub fn is_trusted(&self) -> bool {
        self.trusted
    }

    pub fn is_unknown(&self) -> bool {
        self.fingerprint == UNKNOWN_FINGERPRINT
    }

    /// Verify a base64 signature over `payload` with this certificate's public key
    pub fn verify_signature(&self, signature: &str, payload: &str, algorithm: SignatureAlgorithm) -> bool {
        let Some(certificate) = &self.certificate else {
            return false;
        };
        match verify(certificate, signature, payload, algorithm) {
            Ok(valid) => valid,
            Err(e) => {
                debug!("Signature check for {} failed: {:#}", self.common_name, e);
                false
            }
        }
    }
}

impl PartialEq for IdentityCertificate {
    fn eq(&self, other: &Self) -> bool {
        self.data_record() == other.data_record()
    }
}

impl fmt::Debug for IdentityCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityCertificate")
            .field("fingerprint", &self.fingerprint)
            .field("common_name", &self.common_name)
            .field("organization", &self.organization)
            .field("trusted", &self.trusted)
            .finish()
    }
}

impl fmt::Display for IdentityCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.organization, self.common_name)
    }
}

fn verify(certificate: &X509, signature: &str, payload: &str, algorithm: SignatureAlgorithm) -> Result<bool> {
    let signature = STANDARD
        .decode(signature.trim())
        .map_err(|e| anyhow!("Signature is not base64: {}", e))?;
    let public_key = certificate.public_key()?;
    let mut verifier = Verifier::new(algorithm.digest(), &public_key)?;
    verifier.update(payload.as_bytes())?;
    Ok(verifier.verify(&signature)?)
}

/// PEM, or bare base64 DER as some clients send it
fn decode_certificate(text: &str) -> Result<X509> {
    let text = text.trim();
    if text.contains("-----BEGIN") {
        return X509::from_pem(text.as_bytes()).map_err(|e| anyhow!("Invalid PEM certificate: {}", e));
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(compact)
        .map_err(|e| anyhow!("Certificate is neither PEM nor base64: {}", e))?;
    X509::from_der(&der).map_err(|e| anyhow!("Invalid DER certificate: {}", e))
}

/// Lowercase hex SHA-1 of the DER encoding
pub fn fingerprint(certificate: &X509Ref) -> Result<String> {
    let digest = certificate
        .digest(MessageDigest::sha1())
        .map_err(|e| anyhow!("Failed to fingerprint certificate: {}", e))?;
    Ok(hex::encode(digest))
}

fn format_time(time: &Asn1TimeRef) -> Result<String> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(seconds, 0)
        .map(|t| t.format(DATE_FORMAT).to_string())
        .ok_or_else(|| anyhow!("Certificate time out of range"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::certificate_chain_builder::CertificateChainBuilder;
    use crate::key_material::KeyMaterial;
    use openssl::sign::Signer;
    use secrecy::SecretString;

    /// A vendor root and a site certificate it signed
    pub(crate) struct Vendor {
        pub(crate) root: KeyMaterial,
        pub(crate) site: KeyMaterial,
    }

    impl Vendor {
        pub(crate) fn new(site: &str) -> Self {
            let builder = CertificateChainBuilder::new(SecretString::from("pw".to_string()));
            let root = builder.create_root_certificate(&[]).unwrap();
            let site = builder.create_leaf_certificate(&root, &[site.to_string()]).unwrap();
            Self { root, site }
        }

        pub(crate) fn site_pem(&self) -> String {
            String::from_utf8(self.site.certificate().to_pem().unwrap()).unwrap()
        }

        pub(crate) fn identity(&self) -> IdentityCertificate {
            IdentityCertificate::from_pem(&self.site_pem(), Some(self.root.certificate())).unwrap()
        }

        pub(crate) fn sign(&self, payload: &str, algorithm: SignatureAlgorithm) -> String {
            let mut signer = Signer::new(algorithm.digest(), self.site.private_key()).unwrap();
            signer.update(payload.as_bytes()).unwrap();
            STANDARD.encode(signer.sign_to_vec().unwrap())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::Vendor;
    use super::*;

    #[test]
    fn test_identity_trusted_only_by_its_root() {
        let vendor = Vendor::new("shop.example.com");
        let other = Vendor::new("other.example.com");

        let identity = vendor.identity();
        assert!(identity.is_trusted());
        assert_eq!(identity.common_name(), "shop.example.com");
        assert_eq!(identity.organization(), "Localgate");
        assert_eq!(identity.fingerprint().len(), 40);

        let foreign = IdentityCertificate::from_pem(&vendor.site_pem(), Some(other.root.certificate())).unwrap();
        assert!(!foreign.is_trusted());
        let rootless = IdentityCertificate::from_pem(&vendor.site_pem(), None).unwrap();
        assert!(!rootless.is_trusted());
        assert_eq!(rootless.fingerprint(), identity.fingerprint());
    }

    #[test]
    fn test_intermediate_marker_and_bare_base64() {
        let vendor = Vendor::new("shop.example.com");
        let root_pem = String::from_utf8(vendor.root.certificate().to_pem().unwrap()).unwrap();
        let bundle = format!("{}{}{}", vendor.site_pem(), INTERMEDIATE_MARKER, root_pem);
        let identity = IdentityCertificate::from_pem(&bundle, Some(vendor.root.certificate())).unwrap();
        assert!(identity.is_trusted());

        let der = STANDARD.encode(vendor.site.certificate().to_der().unwrap());
        let bare = IdentityCertificate::from_pem(&der, None).unwrap();
        assert_eq!(bare.fingerprint(), identity.fingerprint());

        assert!(IdentityCertificate::from_pem("garbage", None).is_err());
    }

    #[test]
    fn test_data_record_round_trips_for_listing() {
        let identity = Vendor::new("shop.example.com").identity();
        let record = identity.data_record();
        assert_eq!(record.split('\t').count(), 6);
        assert!(record.ends_with("\ttrue"));
        assert_eq!(IdentityCertificate::from_data_record(&record), Some(identity));

        let unknown = IdentityCertificate::unknown();
        assert!(unknown.is_unknown());
        assert!(unknown.data_record().starts_with("UNKNOWN REQUEST\tAn anonymous request\tUnknown"));
        assert_eq!(IdentityCertificate::from_data_record("short\tline"), None);
    }

    #[test]
    fn test_signature_verification() {
        let vendor = Vendor::new("shop.example.com");
        let identity = vendor.identity();
        let payload = r#"{"call":"print","params":{},"timestamp":1}"#;

        let sha1 = vendor.sign(payload, SignatureAlgorithm::Sha1);
        assert!(identity.verify_signature(&sha1, payload, SignatureAlgorithm::Sha1));
        assert!(!identity.verify_signature(&sha1, payload, SignatureAlgorithm::Sha512));
        assert!(!identity.verify_signature(&sha1, "tampered", SignatureAlgorithm::Sha1));
        assert!(!identity.verify_signature("%%%", payload, SignatureAlgorithm::Sha1));
        assert!(!IdentityCertificate::unknown().verify_signature(&sha1, payload, SignatureAlgorithm::Sha1));

        assert_eq!("sha-256".parse::<SignatureAlgorithm>().unwrap(), SignatureAlgorithm::Sha256);
        assert!("MD5".parse::<SignatureAlgorithm>().is_err());
    }
}
