//! Certificate Manager
//!
//! Decides whether the gateway runs on trust material found on disk or on
//! freshly generated material, persists whatever it generates, and owns the
//! reloadable TLS context handed to the secure listener.
//!
//! # Construction paths
//! - [`CertificateManager::load_or_create`]: look for `localgate.properties` in
//!   each candidate directory (application dir, shared dir, user dir, in that
//!   order). The first manifest whose keystores open wins. When none does, or
//!   when `force_new` is set, a new root and transport certificate are generated.
//! - [`CertificateManager::import_pem`] / [`CertificateManager::import_pkcs12`]:
//!   use a caller supplied key and certificate as transport material. No local
//!   root exists in this mode and nothing needs installing.
//!
//! # Files written
//! ```text
//! <writable>/localgate.properties
//! <writable>/ssl/root-ca.p12     root key + certificate
//! <writable>/ssl/root-ca.crt     PEM export installed into trust stores
//! <writable>/ssl/localgate.p12   transport key + certificate + root
//! <writable>/ssl/localgate.crt
//! ```
//!
//! The root is only generated together with a fresh manifest. Renewal replaces
//! the transport certificate and never touches the root, since every trust store
//! install would otherwise go stale.

use anyhow::{anyhow, Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::certificate_chain_builder::{CertificateChainBuilder, CertificateIdentity};
use crate::generate_root_ca::days_until;
use crate::key_material::{copy_secret, generate_password, KeyMaterial, Role};
use crate::platform::Platform;
use crate::tls_context::ReloadableCertResolver;
use crate::trust_manifest::{role_key, TrustManifest, MANIFEST_FILE_NAME};

pub const APP_NAME: &str = "localgate";
pub const SSL_SUBDIR: &str = "ssl";
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

// ================= Storage locations =================

/// Candidate directories for the manifest and keystores, most preferred first
#[derive(Debug, Clone)]
pub struct StorageLocations {
    app_dir: Option<PathBuf>,
    candidates: Vec<PathBuf>,
    temp_dir: PathBuf,
}

impl StorageLocations {
    /// Application dir (when given), then shared dir, then user dir
    pub fn for_platform(platform: Platform, app_dir: Option<PathBuf>) -> Self {
        let mut candidates = Vec::new();
        if let Some(dir) = &app_dir {
            candidates.push(dir.clone());
        }
        candidates.push(platform.shared_dir(APP_NAME));
        candidates.push(platform.user_dir(APP_NAME));
        Self {
            app_dir,
            candidates,
            temp_dir: std::env::temp_dir().join(APP_NAME),
        }
    }

    /// Explicit directory list, used for configured overrides
    pub fn from_dirs(dirs: Vec<PathBuf>) -> Self {
        Self {
            app_dir: None,
            candidates: dirs,
            temp_dir: std::env::temp_dir().join(APP_NAME),
        }
    }

    pub fn with_temp_dir(mut self, temp_dir: PathBuf) -> Self {
        self.temp_dir = temp_dir;
        self
    }

    pub fn candidates(&self) -> &[PathBuf] {
        &self.candidates
    }

    /// First writable candidate, falling back to the temp directory
    ///
    /// With a suffix (the `ssl` keystore directory) the application directory is
    /// skipped so installed program files stay untouched.
    pub fn writable(&self, suffix: Option<&str>) -> Result<PathBuf> {
        let mut locations: Vec<PathBuf> = self
            .candidates
            .iter()
            .filter(|dir| suffix.is_none() || Some(*dir) != self.app_dir.as_ref())
            .map(|dir| with_suffix(dir, suffix))
            .collect();
        locations.push(with_suffix(&self.temp_dir, suffix));

        for (idx, location) in locations.iter().enumerate() {
            if is_writable(location) {
                if idx > 0 {
                    warn!(
                        "{} isn't the preferred write location, but we'll use it anyway",
                        location.display()
                    );
                }
                debug!("Writing to {}", location.display());
                return Ok(location.clone());
            }
            debug!("Can't write to {}, trying the next...", location.display());
        }
        Err(anyhow!("Can't find a suitable write location for trust material"))
    }
}

fn with_suffix(dir: &Path, suffix: Option<&str>) -> PathBuf {
    match suffix {
        Some(s) => dir.join(s),
        None => dir.to_path_buf(),
    }
}

fn is_writable(dir: &Path) -> bool {
    if fs::create_dir_all(dir).is_err() {
        return false;
    }
    let probe = dir.join(".localgate-write-test");
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

// ================= Certificate Manager =================

pub struct CertificateManager {
    locations: StorageLocations,
    identity: CertificateIdentity,
    ca: Option<KeyMaterial>,
    leaf: KeyMaterial,
    manifest: TrustManifest,
    password: SecretString,
    needs_install: bool,
    root_certificate_file: Option<PathBuf>,
    security: Option<Arc<ReloadableCertResolver>>,
}

/// Material found on disk for one candidate directory
struct LoadedMaterial {
    ca: Option<KeyMaterial>,
    leaf: KeyMaterial,
    manifest: TrustManifest,
}

impl CertificateManager {
    /// Load existing material, or generate and persist a new root and leaf
    pub fn load_or_create(
        locations: StorageLocations,
        host_names: &[String],
        force_new: bool,
    ) -> Result<Self> {
        Self::load_or_create_with_identity(
            locations,
            CertificateIdentity::default(),
            host_names,
            force_new,
        )
    }

    pub fn load_or_create_with_identity(
        locations: StorageLocations,
        identity: CertificateIdentity,
        host_names: &[String],
        force_new: bool,
    ) -> Result<Self> {
        if !force_new {
            if let Some(loaded) = Self::find_existing(&locations) {
                return Ok(Self::from_loaded(locations, identity, loaded));
            }
            warn!("Trust manifest won't be loaded from disk, generating new certificates");
        } else {
            info!("Forcing generation of a new root and transport certificate");
        }

        let password = generate_password()?;
        let builder = CertificateChainBuilder::with_identity(identity.clone(), copy_secret(&password));
        let ca = builder
            .create_root_certificate(host_names)
            .context("Failed to create root certificate")?;
        let leaf = builder
            .create_leaf_certificate(&ca, host_names)
            .context("Failed to create transport certificate")?;

        let mut manager = Self {
            locations,
            identity,
            ca: Some(ca),
            leaf,
            manifest: TrustManifest::new(),
            password,
            needs_install: false,
            root_certificate_file: None,
            security: None,
        };

        manager.write_certificate(Role::Ca)?;
        manager.write_keystore(Role::Ca)?;
        manager.write_certificate(Role::Leaf)?;
        manager.write_keystore(Role::Leaf)?;
        manager.save_manifest()?;
        Ok(manager)
    }

    /// Load existing material only; never generates anything
    pub fn load_existing(locations: StorageLocations) -> Result<Self> {
        let loaded = Self::find_existing(&locations).ok_or_else(|| {
            anyhow!(
                "No {} found in {:?}; run certgen first",
                MANIFEST_FILE_NAME,
                locations.candidates()
            )
        })?;
        Ok(Self::from_loaded(locations, CertificateIdentity::default(), loaded))
    }

    fn from_loaded(locations: StorageLocations, identity: CertificateIdentity, loaded: LoadedMaterial) -> Self {
        let password = copy_secret(loaded.leaf.password());
        Self {
            locations,
            identity,
            ca: loaded.ca,
            leaf: loaded.leaf,
            manifest: loaded.manifest,
            password,
            needs_install: false,
            root_certificate_file: None,
            security: None,
        }
    }

    /// Use a PEM key and certificate chain, e.g. `privkey.pem` + `fullchain.pem`
    pub fn import_pem(locations: StorageLocations, key_file: &Path, cert_file: &Path) -> Result<Self> {
        let password = generate_password()?;
        let leaf = KeyMaterial::from_pem_files(key_file, cert_file, copy_secret(&password))?;
        Self::from_imported(locations, leaf, password)
    }

    /// Use an existing PKCS#12 keystore; its first key entry is taken whatever the alias
    pub fn import_pkcs12(
        locations: StorageLocations,
        keystore: &Path,
        password: SecretString,
    ) -> Result<Self> {
        let (leaf, alias) = KeyMaterial::from_keystore(Role::Leaf, keystore, copy_secret(&password))?;
        if let Some(alias) = alias {
            debug!("Imported key entry '{}' from {}", alias, keystore.display());
        }
        Self::from_imported(locations, leaf, password)
    }

    fn from_imported(
        locations: StorageLocations,
        leaf: KeyMaterial,
        password: SecretString,
    ) -> Result<Self> {
        let mut manager = Self {
            locations,
            identity: CertificateIdentity::default(),
            ca: None,
            leaf,
            manifest: TrustManifest::new(),
            password,
            needs_install: false,
            root_certificate_file: None,
            security: None,
        };
        manager.write_keystore(Role::Leaf)?;
        manager.save_manifest()?;
        Ok(manager)
    }

    fn find_existing(locations: &StorageLocations) -> Option<LoadedMaterial> {
        info!("Looking for an existing trust manifest...");
        for location in locations.candidates() {
            let manifest_path = location.join(MANIFEST_FILE_NAME);
            if !manifest_path.exists() {
                continue;
            }
            match Self::load_from(location, &manifest_path) {
                Ok(loaded) => {
                    info!("Found {}", manifest_path.display());
                    return Some(loaded);
                }
                Err(e) => warn!(
                    "Trust material couldn't be loaded from {}, trying fallback: {:#}",
                    location.display(),
                    e
                ),
            }
        }
        info!("No usable trust manifest found");
        None
    }

    fn load_from(parent: &Path, manifest_path: &Path) -> Result<LoadedMaterial> {
        let manifest = TrustManifest::load(manifest_path)?;
        let mut leaf = load_role(&manifest, parent, Role::Leaf)?
            .ok_or_else(|| anyhow!("Missing {} entry", role_key(Role::Leaf, "keystore")))?;
        let ca = load_role(&manifest, parent, Role::Ca)?;

        if let Some(ca) = &ca {
            if leaf.chain().is_empty() {
                leaf = leaf.with_chain(vec![ca.certificate().clone()]);
            }
        }
        Ok(LoadedMaterial { ca, leaf, manifest })
    }

    // ================= Persistence =================

    fn material(&self, role: Role) -> Result<&KeyMaterial> {
        match role {
            Role::Leaf => Ok(&self.leaf),
            Role::Ca => self.ca.as_ref().ok_or_else(|| anyhow!("No root CA is loaded")),
        }
    }

    /// Export a role's certificate as PEM next to the keystores
    pub fn write_certificate(&mut self, role: Role) -> Result<PathBuf> {
        let dir = self.locations.writable(Some(SSL_SUBDIR))?;
        let path = dir.join(role.certificate_file_name());
        self.material(role)?.write_certificate(&path)?;
        info!("Wrote certificate: {}", path.display());
        if role == Role::Ca {
            self.needs_install = true;
            self.root_certificate_file = Some(path.clone());
        }
        Ok(path)
    }

    fn write_keystore(&mut self, role: Role) -> Result<PathBuf> {
        let dir = self.locations.writable(Some(SSL_SUBDIR))?;
        let path = dir.join(role.keystore_file_name());
        match role {
            Role::Leaf => self.leaf.save_keystore(&path)?,
            Role::Ca => self
                .ca
                .as_mut()
                .ok_or_else(|| anyhow!("No root CA is loaded"))?
                .save_keystore(&path)?,
        }
        info!("Wrote PKCS#12 keystore: {}", path.display());

        let path_str = path.to_string_lossy().into_owned();
        let password = self.password.expose_secret().to_string();
        self.manifest.put(&role_key(role, "keystore"), &path_str);
        self.manifest.put(&role_key(role, "storepass"), &password);
        self.manifest.put(&role_key(role, "alias"), role.alias());
        if role == Role::Leaf {
            self.manifest
                .put_if_absent(&role_key(role, "host"), DEFAULT_BIND_HOST);
        }
        Ok(path)
    }

    fn save_manifest(&mut self) -> Result<()> {
        let dir = self.locations.writable(None)?;
        let path = dir.join(MANIFEST_FILE_NAME);
        self.manifest.save_merged(&path)?;
        info!("Saved trust manifest: {}", path.display());
        Ok(())
    }

    // ================= Lifecycle =================

    /// True when this run generated a root that the OS does not know about yet
    pub fn needs_install(&self) -> bool {
        self.needs_install
    }

    /// Replace the transport certificate, signed by the existing root
    pub fn renew(&mut self, host_names: &[String]) -> Result<()> {
        let ca = self
            .ca
            .as_ref()
            .ok_or_else(|| anyhow!("Cannot renew an imported certificate without a local root CA"))?;
        let builder =
            CertificateChainBuilder::with_identity(self.identity.clone(), copy_secret(&self.password));
        self.leaf = builder.create_leaf_certificate(ca, host_names)?;
        self.write_certificate(Role::Leaf)?;
        self.write_keystore(Role::Leaf)?;
        self.save_manifest()?;
        info!("Transport certificate renewed");
        self.reload()
    }

    /// Push the current transport certificate into the live TLS context
    ///
    /// A no-op until [`security_context`](Self::security_context) has been
    /// requested; safe to call repeatedly.
    pub fn reload(&self) -> Result<()> {
        match &self.security {
            Some(resolver) => resolver.swap(&self.leaf),
            None => Ok(()),
        }
    }

    /// The resolver shared with the secure listener
    pub fn security_context(&mut self) -> Result<Arc<ReloadableCertResolver>> {
        if let Some(resolver) = &self.security {
            return Ok(Arc::clone(resolver));
        }
        let resolver = Arc::new(ReloadableCertResolver::new(&self.leaf)?);
        self.security = Some(Arc::clone(&resolver));
        Ok(resolver)
    }

    /// Days until the transport certificate expires
    pub fn leaf_days_remaining(&self) -> Result<i32> {
        days_until(self.leaf.certificate().not_after())
    }

    /// PEM file of the root, exporting it first when this run loaded from disk
    pub fn root_certificate_file(&mut self) -> Result<PathBuf> {
        if let Some(path) = &self.root_certificate_file {
            if path.exists() {
                return Ok(path.clone());
            }
        }
        let installed_before = self.needs_install;
        let path = self.write_certificate(Role::Ca)?;
        self.needs_install = installed_before;
        Ok(path)
    }

    pub fn ca(&self) -> Option<&KeyMaterial> {
        self.ca.as_ref()
    }

    pub fn leaf(&self) -> &KeyMaterial {
        &self.leaf
    }

    pub fn identity(&self) -> &CertificateIdentity {
        &self.identity
    }

    pub fn manifest(&self) -> &TrustManifest {
        &self.manifest
    }

    /// Bind host recorded in the manifest
    pub fn bind_host(&self) -> String {
        self.manifest
            .role_value(Role::Leaf, "host")
            .unwrap_or(DEFAULT_BIND_HOST)
            .to_string()
    }
}

/// Open one role's keystore as described by the manifest
///
/// `Ok(None)` only for a CA section that is absent altogether, which is normal
/// after a leaf-only import. A keystore that is missing or has no entry under
/// the recorded alias is an error so the caller treats the manifest as unusable.
fn load_role(manifest: &TrustManifest, parent: &Path, role: Role) -> Result<Option<KeyMaterial>> {
    let keystore = match manifest.role_value(role, "keystore") {
        Some(ks) => PathBuf::from(ks),
        None if role == Role::Ca => return Ok(None),
        None => return Err(anyhow!("Missing {} entry", role_key(role, "keystore"))),
    };
    let keystore = if keystore.is_absolute() {
        keystore
    } else {
        parent.join(keystore)
    };
    if !keystore.exists() {
        return Err(anyhow!("Keystore {} does not exist", keystore.display()));
    }

    let password = SecretString::from(manifest.get(&role_key(role, "storepass")).unwrap_or("").to_string());
    let expected_alias = manifest
        .role_value(role, "alias")
        .unwrap_or(role.alias())
        .to_string();
    let (material, alias) = KeyMaterial::from_keystore(role, &keystore, password)?;
    if let Some(alias) = alias {
        if !alias.eq_ignore_ascii_case(&expected_alias) {
            return Err(anyhow!(
                "Keystore {} has no entry under alias '{}'",
                keystore.display(),
                expected_alias
            ));
        }
    }
    Ok(Some(material))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate_chain_builder::chains_to;
    use tempfile::TempDir;

    fn locations(dir: &TempDir) -> StorageLocations {
        StorageLocations::from_dirs(vec![dir.path().join("shared"), dir.path().join("user")])
            .with_temp_dir(dir.path().join("tmp"))
    }

    #[test]
    fn test_first_run_generates_and_persists() {
        let dir = TempDir::new().unwrap();
        let manager = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();

        assert!(manager.needs_install());
        let shared = dir.path().join("shared");
        assert!(shared.join(MANIFEST_FILE_NAME).exists());
        assert!(shared.join("ssl/root-ca.p12").exists());
        assert!(shared.join("ssl/root-ca.crt").exists());
        assert!(shared.join("ssl/localgate.p12").exists());

        let manifest = TrustManifest::load(&shared.join(MANIFEST_FILE_NAME)).unwrap();
        assert_eq!(manifest.get("ca.alias"), Some("root-ca"));
        assert_eq!(manifest.get("wss.alias"), Some("localgate"));
        assert_eq!(manifest.get("wss.host"), Some("0.0.0.0"));
        assert_eq!(manifest.get("ca.storepass"), manifest.get("wss.storepass"));
    }

    #[test]
    fn test_second_run_loads_existing_material() {
        let dir = TempDir::new().unwrap();
        let first = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let second = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();

        assert!(!second.needs_install());
        assert_eq!(
            first.ca().unwrap().certificate().to_der().unwrap(),
            second.ca().unwrap().certificate().to_der().unwrap()
        );
        assert_eq!(
            first.leaf().certificate().to_der().unwrap(),
            second.leaf().certificate().to_der().unwrap()
        );
        assert_eq!(second.leaf().chain().len(), 1);
    }

    #[test]
    fn test_load_existing_never_generates() {
        let dir = TempDir::new().unwrap();
        assert!(CertificateManager::load_existing(locations(&dir)).is_err());
        assert!(!dir.path().join("shared").join(MANIFEST_FILE_NAME).exists());

        let created = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let loaded = CertificateManager::load_existing(locations(&dir)).unwrap();
        assert_eq!(
            loaded.leaf().certificate().to_der().unwrap(),
            created.leaf().certificate().to_der().unwrap()
        );
        assert!(!loaded.needs_install());
    }

    #[test]
    fn test_missing_keystore_regenerates() {
        let dir = TempDir::new().unwrap();
        let first = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        fs::remove_file(dir.path().join("shared/ssl/localgate.p12")).unwrap();

        let second = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        assert!(second.needs_install());
        assert_ne!(
            first.ca().unwrap().certificate().to_der().unwrap(),
            second.ca().unwrap().certificate().to_der().unwrap()
        );
    }

    #[test]
    fn test_force_new_skips_loading() {
        let dir = TempDir::new().unwrap();
        let first = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let forced = CertificateManager::load_or_create(locations(&dir), &[], true).unwrap();
        assert!(forced.needs_install());
        assert_ne!(
            first.leaf().certificate().to_der().unwrap(),
            forced.leaf().certificate().to_der().unwrap()
        );
    }

    #[test]
    fn test_regeneration_keeps_hand_edited_host() {
        let dir = TempDir::new().unwrap();
        CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let path = dir.path().join("shared").join(MANIFEST_FILE_NAME);
        let mut edited = TrustManifest::load(&path).unwrap();
        edited.put("wss.host", "127.0.0.1");
        fs::write(&path, edited.to_properties_string()).unwrap();

        CertificateManager::load_or_create(locations(&dir), &[], true).unwrap();
        let on_disk = TrustManifest::load(&path).unwrap();
        assert_eq!(on_disk.get("wss.host"), Some("127.0.0.1"));
        assert_ne!(on_disk.get("wss.storepass"), edited.get("wss.storepass"));
    }

    #[test]
    fn test_renew_keeps_root_and_reloads() {
        let dir = TempDir::new().unwrap();
        let mut manager = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let resolver = manager.security_context().unwrap();
        let root_before = manager.ca().unwrap().certificate().to_der().unwrap();
        let leaf_before = manager.leaf().certificate().to_der().unwrap();

        manager.renew(&["printer.local".to_string()]).unwrap();

        assert_eq!(manager.ca().unwrap().certificate().to_der().unwrap(), root_before);
        let leaf_after = manager.leaf().certificate().to_der().unwrap();
        assert_ne!(leaf_after, leaf_before);
        assert!(chains_to(
            manager.leaf().certificate(),
            &[],
            manager.ca().unwrap().certificate()
        )
        .unwrap());
        assert_eq!(resolver.generation(), 1);
        assert_eq!(resolver.current().cert[0].as_ref(), leaf_after.as_slice());

        let reloaded = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        assert_eq!(reloaded.leaf().certificate().to_der().unwrap(), leaf_after);
    }

    #[test]
    fn test_import_keeps_existing_ca_section() {
        let dir = TempDir::new().unwrap();
        let generated = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();

        let key_path = dir.path().join("privkey.pem");
        let cert_path = dir.path().join("fullchain.pem");
        fs::write(
            &key_path,
            generated.leaf().private_key().private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap();
        fs::write(&cert_path, generated.leaf().certificate().to_pem().unwrap()).unwrap();

        let imported = CertificateManager::import_pem(locations(&dir), &key_path, &cert_path).unwrap();
        assert!(!imported.needs_install());
        assert!(imported.ca().is_none());

        let manifest =
            TrustManifest::load(&dir.path().join("shared").join(MANIFEST_FILE_NAME)).unwrap();
        assert!(manifest.get("ca.keystore").is_some());
        assert!(manifest.get("wss.keystore").is_some());
    }

    #[test]
    fn test_renew_requires_local_root() {
        let dir = TempDir::new().unwrap();
        let generated = CertificateManager::load_or_create(locations(&dir), &[], false).unwrap();
        let p12 = dir.path().join("external.p12");
        fs::write(&p12, generated.leaf().to_pkcs12_der().unwrap()).unwrap();

        let mut imported = CertificateManager::import_pkcs12(
            locations(&dir),
            &p12,
            copy_secret(generated.leaf().password()),
        )
        .unwrap();
        assert!(imported.renew(&[]).is_err());
    }

    #[test]
    fn test_writable_falls_back_past_unusable_candidates() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"not a directory").unwrap();
        let locations = StorageLocations::from_dirs(vec![blocker.join("nested"), dir.path().join("user")])
            .with_temp_dir(dir.path().join("tmp"));

        let chosen = locations.writable(Some(SSL_SUBDIR)).unwrap();
        assert_eq!(chosen, dir.path().join("user").join(SSL_SUBDIR));
    }
}
