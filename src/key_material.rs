//! In-memory key material for the root CA and the transport certificate
//!
//! A [`KeyMaterial`] pairs a private key with its certificate, the issuer chain
//! the certificate should be presented with, the keystore password and, once
//! persisted, the keystore file it lives in. The password is held in a
//! [`SecretString`] so it never shows up in debug output or logs.
//!
//! Keystores are PKCS#12 files with a single key entry stored under the role's
//! fixed alias. The transport keystore additionally carries the root certificate
//! so the listener can present a complete chain.

use anyhow::{anyhow, Context, Result};
use openssl::bn::{BigNum, MsbOption};
use openssl::nid::Nid;
use openssl::pkcs12::Pkcs12;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::{X509Ref, X509};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const ROOT_ALIAS: &str = "root-ca";
pub const LEAF_ALIAS: &str = "localgate";
pub const KEYSTORE_EXTENSION: &str = "p12";
pub const CERTIFICATE_EXTENSION: &str = "crt";
const PASSWORD_BITS: i32 = 100;

/// Which half of the chain a [`KeyMaterial`] represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Ca,
    Leaf,
}

impl Role {
    /// Alias of the key entry inside the keystore, also the keystore file stem
    pub fn alias(self) -> &'static str {
        match self {
            Role::Ca => ROOT_ALIAS,
            Role::Leaf => LEAF_ALIAS,
        }
    }

    /// Prefix of this role's keys in the trust manifest
    pub fn props_prefix(self) -> &'static str {
        match self {
            Role::Ca => "ca",
            Role::Leaf => "wss",
        }
    }

    pub fn keystore_file_name(self) -> String {
        format!("{}.{}", self.alias(), KEYSTORE_EXTENSION)
    }

    pub fn certificate_file_name(self) -> String {
        format!("{}.{}", self.alias(), CERTIFICATE_EXTENSION)
    }
}

pub struct KeyMaterial {
    role: Role,
    private_key: PKey<Private>,
    certificate: X509,
    chain: Vec<X509>,
    password: SecretString,
    keystore: Option<PathBuf>,
}

impl KeyMaterial {
    pub fn new(
        role: Role,
        private_key: PKey<Private>,
        certificate: X509,
        password: SecretString,
    ) -> Self {
        Self {
            role,
            private_key,
            certificate,
            chain: Vec::new(),
            password,
            keystore: None,
        }
    }

    /// Attach the issuer chain, nearest issuer first
    pub fn with_chain(mut self, chain: Vec<X509>) -> Self {
        self.chain = chain;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn private_key(&self) -> &PKey<Private> {
        &self.private_key
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn chain(&self) -> &[X509] {
        &self.chain
    }

    pub fn password(&self) -> &SecretString {
        &self.password
    }

    /// Keystore file backing this material, once loaded or saved
    pub fn keystore_path(&self) -> Option<&Path> {
        self.keystore.as_deref()
    }

    /// The certificate followed by its issuers, as presented during a handshake
    pub fn full_chain(&self) -> Vec<&X509Ref> {
        std::iter::once(&*self.certificate)
            .chain(self.chain.iter().map(|c| &**c))
            .collect()
    }

    /// Serialize to a password protected PKCS#12 container
    pub fn to_pkcs12_der(&self) -> Result<Vec<u8>> {
        let mut builder = Pkcs12::builder();
        builder
            .name(self.role.alias())
            .pkey(&self.private_key)
            .cert(&self.certificate);

        if !self.chain.is_empty() {
            let mut ca = Stack::new().map_err(|e| anyhow!("Failed to create stack: {}", e))?;
            for cert in &self.chain {
                ca.push(cert.clone())
                    .map_err(|e| anyhow!("Failed to add chain certificate: {}", e))?;
            }
            builder.ca(ca);
        }

        let pkcs12 = builder
            .build2(self.password.expose_secret())
            .map_err(|e| anyhow!("Failed to build PKCS#12 keystore: {}", e))?;
        pkcs12
            .to_der()
            .map_err(|e| anyhow!("Failed to encode PKCS#12 keystore: {}", e))
    }

    /// Write the keystore and remember where it lives
    pub fn save_keystore(&mut self, path: &Path) -> Result<()> {
        let der = self.to_pkcs12_der()?;
        fs::write(path, der).context(format!("Failed to write keystore {}", path.display()))?;
        self.keystore = Some(path.to_path_buf());
        Ok(())
    }

    /// Load from a PKCS#12 keystore
    ///
    /// A keystore holds a single key entry. Its friendly name is returned next to
    /// the material so the caller can decide whether an alias mismatch matters;
    /// the entry itself is used either way.
    pub fn from_keystore(
        role: Role,
        path: &Path,
        password: SecretString,
    ) -> Result<(Self, Option<String>)> {
        let der = fs::read(path).context(format!("Failed to read keystore {}", path.display()))?;
        let parsed = Pkcs12::from_der(&der)
            .map_err(|e| anyhow!("Failed to decode keystore {}: {}", path.display(), e))?
            .parse2(password.expose_secret())
            .map_err(|e| anyhow!("Failed to open keystore {}: {}", path.display(), e))?;

        let private_key = parsed
            .pkey
            .ok_or_else(|| anyhow!("Keystore {} has no private key entry", path.display()))?;
        let certificate = parsed
            .cert
            .ok_or_else(|| anyhow!("Keystore {} has no certificate entry", path.display()))?;
        let alias = certificate
            .alias()
            .map(|a| String::from_utf8_lossy(a).into_owned());
        let chain = parsed
            .ca
            .map(|stack| stack.into_iter().collect())
            .unwrap_or_default();

        let mut material = Self::new(role, private_key, certificate, password).with_chain(chain);
        material.keystore = Some(path.to_path_buf());
        Ok((material, alias))
    }

    /// Import a PEM private key and PEM certificate chain as transport material
    ///
    /// The key may be PKCS#8 or traditional RSA. When the certificate file holds
    /// no certificates, a chain appended to the key file is used instead.
    pub fn from_pem_files(key_file: &Path, cert_file: &Path, password: SecretString) -> Result<Self> {
        let key_pem = fs::read(key_file)
            .context(format!("Failed to read private key from {}", key_file.display()))?;
        let private_key = PKey::private_key_from_pem(&key_pem)
            .context(format!("Failed to parse private key PEM {}", key_file.display()))?;

        let cert_pem = fs::read(cert_file)
            .context(format!("Failed to read certificate from {}", cert_file.display()))?;
        let mut certs = X509::stack_from_pem(&cert_pem).unwrap_or_default();
        if certs.is_empty() {
            certs = X509::stack_from_pem(&key_pem).unwrap_or_default();
        }
        if certs.is_empty() {
            return Err(anyhow!(
                "No certificates found in {} or {}",
                cert_file.display(),
                key_file.display()
            ));
        }

        let leaf = certs.remove(0);
        let leaf_public = leaf.public_key()?;
        if !leaf_public.public_eq(&private_key) {
            return Err(anyhow!(
                "Certificate in {} does not match the private key",
                cert_file.display()
            ));
        }

        Ok(Self::new(Role::Leaf, private_key, leaf, password).with_chain(certs))
    }

    /// Export the certificate as PEM
    pub fn write_certificate(&self, path: &Path) -> Result<()> {
        let pem = self.certificate.to_pem()?;
        if path.exists() {
            fs::remove_file(path).context(format!("Failed to replace {}", path.display()))?;
        }
        fs::write(path, pem).context(format!("Failed to write certificate {}", path.display()))
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("role", &self.role)
            .field("subject", &subject_common_name(&self.certificate))
            .field("chain_len", &self.chain.len())
            .field("password", &"<redacted>")
            .field("keystore", &self.keystore)
            .finish()
    }
}

/// Fresh keystore password: 100 random bits in lowercase hex
pub fn generate_password() -> Result<SecretString> {
    let mut bits = BigNum::new()?;
    bits.rand(PASSWORD_BITS, MsbOption::MAYBE_ZERO, false)
        .map_err(|e| anyhow!("Failed to generate password: {}", e))?;
    let hex = bits.to_hex_str()?.to_lowercase();
    Ok(SecretString::from(hex))
}

pub fn copy_secret(secret: &SecretString) -> SecretString {
    SecretString::from(secret.expose_secret().to_string())
}

fn subject_entry(cert: &X509Ref, nid: Nid) -> Option<String> {
    cert.subject_name()
        .entries_by_nid(nid)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
}

pub fn subject_common_name(cert: &X509Ref) -> Option<String> {
    subject_entry(cert, Nid::COMMONNAME)
}

pub fn subject_organization(cert: &X509Ref) -> Option<String> {
    subject_entry(cert, Nid::ORGANIZATIONNAME)
}

/// True when the subject emailAddress equals this application's identity marker
pub fn email_matches(cert: &X509Ref, marker: &str) -> bool {
    subject_entry(cert, Nid::PKCS9_EMAILADDRESS).as_deref() == Some(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_chain_builder::CertificateChainBuilder;
    use crate::generate_root_ca::RsaRootCABuilder;
    use tempfile::TempDir;

    fn password() -> SecretString {
        SecretString::from("hunter2".to_string())
    }

    #[test]
    fn test_password_is_hex_and_random() {
        let a = generate_password().unwrap();
        let b = generate_password().unwrap();
        assert!(a.expose_secret().chars().all(|c| c.is_ascii_hexdigit()));
        assert!(a.expose_secret().len() <= 25);
        assert_ne!(a.expose_secret(), b.expose_secret());
    }

    #[test]
    fn test_debug_no_leak() {
        let builder = CertificateChainBuilder::new(password());
        let root = builder.create_root_certificate(&[]).unwrap();
        let debug_str = format!("{:?}", root);
        assert!(!debug_str.contains("hunter2"));
        assert!(debug_str.contains("redacted"));
    }

    #[test]
    fn test_keystore_keeps_chain_and_key() {
        let dir = TempDir::new().unwrap();
        let builder = CertificateChainBuilder::new(password());
        let root = builder.create_root_certificate(&[]).unwrap();
        let mut leaf = builder.create_leaf_certificate(&root, &[]).unwrap();

        let path = dir.path().join(Role::Leaf.keystore_file_name());
        leaf.save_keystore(&path).unwrap();

        let (loaded, _) = KeyMaterial::from_keystore(Role::Leaf, &path, password()).unwrap();
        assert_eq!(loaded.chain().len(), 1);
        assert_eq!(
            loaded.chain()[0].to_der().unwrap(),
            root.certificate().to_der().unwrap()
        );
        assert!(loaded.private_key().public_eq(leaf.private_key()));
        assert_eq!(loaded.keystore_path(), Some(path.as_path()));
    }

    #[test]
    fn test_wrong_password_fails() {
        let dir = TempDir::new().unwrap();
        let builder = CertificateChainBuilder::new(password());
        let mut root = builder.create_root_certificate(&[]).unwrap();
        let path = dir.path().join("root-ca.p12");
        root.save_keystore(&path).unwrap();

        let result =
            KeyMaterial::from_keystore(Role::Ca, &path, SecretString::from("nope".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_pem_import_rejects_mismatched_key() {
        let dir = TempDir::new().unwrap();
        let builder = CertificateChainBuilder::new(password());
        let root = builder.create_root_certificate(&[]).unwrap();
        let leaf = builder.create_leaf_certificate(&root, &[]).unwrap();

        let key_path = dir.path().join("privkey.pem");
        let cert_path = dir.path().join("fullchain.pem");
        fs::write(&key_path, root.private_key().private_key_to_pem_pkcs8().unwrap()).unwrap();
        fs::write(&cert_path, leaf.certificate().to_pem().unwrap()).unwrap();

        assert!(KeyMaterial::from_pem_files(&key_path, &cert_path, password()).is_err());
    }

    #[test]
    fn test_pem_import_reads_full_chain() {
        let dir = TempDir::new().unwrap();
        let builder = CertificateChainBuilder::new(password());
        let root = builder.create_root_certificate(&[]).unwrap();
        let leaf = builder.create_leaf_certificate(&root, &[]).unwrap();

        let key_path = dir.path().join("privkey.pem");
        let cert_path = dir.path().join("fullchain.pem");
        fs::write(&key_path, leaf.private_key().private_key_to_pem_pkcs8().unwrap()).unwrap();
        let mut chain = leaf.certificate().to_pem().unwrap();
        chain.extend(root.certificate().to_pem().unwrap());
        fs::write(&cert_path, chain).unwrap();

        let imported = KeyMaterial::from_pem_files(&key_path, &cert_path, password()).unwrap();
        assert_eq!(imported.role(), Role::Leaf);
        assert_eq!(imported.chain().len(), 1);
    }

    #[test]
    fn test_email_marker() {
        let builder = CertificateChainBuilder::new(password());
        let root = builder.create_root_certificate(&[]).unwrap();
        assert!(email_matches(root.certificate(), "trust@localgate.dev"));
        assert!(!email_matches(root.certificate(), "someone@example.com"));
    }

    #[test]
    fn test_subject_fields_decode_utf8() {
        let (_, cert) = RsaRootCABuilder::new()
            .subject_common_name("café.localgate.dev".to_string())
            .organization("Zürich Druckerei".to_string())
            .organizational_unit("Localgate".to_string())
            .locality("Zürich".to_string())
            .state("ZH".to_string())
            .country("CH".to_string())
            .email("trust@localgate.dev".to_string())
            .build()
            .unwrap();
        assert_eq!(subject_common_name(&cert).as_deref(), Some("café.localgate.dev"));
        assert_eq!(subject_organization(&cert).as_deref(), Some("Zürich Druckerei"));
    }
}
