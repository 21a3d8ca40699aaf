//! Linux trust stores
//!
//! SYSTEM installs try both `update-ca-certificates` (Debian family) and
//! `trust anchor` (Fedora family); either succeeding counts. USER installs go
//! into every NSS database that already exists under the home directory.
//! Databases are never created here, browsers create them on first start.

use openssl::x509::X509;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{NativeTrustStore, PrivilegeLevel, StoreIdentity};
use crate::key_material::email_matches;
use crate::platform::home_dir;
use crate::shell::CommandRunner;

pub const DEFAULT_CA_CERTIFICATES_DIR: &str = "/usr/local/share/ca-certificates";
const PKCS11_ID_PREFIX: &str = "pkcs11:id=";

/// NSS databases relative to the home directory
const NSSDB_DIRS: [&str; 5] = [
    ".pki/nssdb",
    "snap/chromium/current/.pki/nssdb",
    "snap/brave/current/.pki/nssdb",
    "snap/opera/current/.pki/nssdb",
    "snap/opera-beta/current/.pki/nssdb",
];

pub struct LinuxTrustStore {
    privilege: PrivilegeLevel,
    identity: StoreIdentity,
    runner: Arc<dyn CommandRunner>,
    ca_dir: PathBuf,
    home: PathBuf,
}

impl LinuxTrustStore {
    pub fn new(privilege: PrivilegeLevel, identity: StoreIdentity, runner: Arc<dyn CommandRunner>) -> Self {
        if privilege == PrivilegeLevel::System {
            warn!("certutil needs to run as USER for NSS browsers; that step is retried on launch");
        }
        Self {
            privilege,
            identity,
            runner,
            ca_dir: PathBuf::from(DEFAULT_CA_CERTIFICATES_DIR),
            home: home_dir(),
        }
    }

    pub fn with_ca_dir(mut self, ca_dir: PathBuf) -> Self {
        self.ca_dir = ca_dir;
        self
    }

    pub fn with_home(mut self, home: PathBuf) -> Self {
        self.home = home;
        self
    }

    fn system_cert_file(&self) -> PathBuf {
        self.ca_dir.join(format!("{}-root.crt", self.identity.file_stem))
    }

    fn nss_databases(&self) -> Vec<PathBuf> {
        NSSDB_DIRS
            .iter()
            .map(|dir| self.home.join(dir))
            .filter(|dir| dir.is_dir())
            .collect()
    }

    fn has_update_ca_certificates(&self) -> bool {
        self.runner.succeeds("which", &["update-ca-certificates"])
    }

    fn has_trust_anchor(&self) -> bool {
        self.runner.succeeds("trust", &["anchor", "--help"])
    }

    /// Copy into the ca-certificates directory and rebuild the bundle
    fn trust_using_update_ca_certificates(&self, cert_file: &Path) -> Option<PathBuf> {
        if !self.has_update_ca_certificates() {
            warn!("Skipping SYSTEM install using update-ca-certificates, command missing");
            return None;
        }
        if !self.ca_dir.is_dir() {
            warn!("{} is not a directory, skipping", self.ca_dir.display());
            return None;
        }
        let dest = self.system_cert_file();
        debug!("Copying {} to {}", cert_file.display(), dest.display());
        if let Err(e) = fs::copy(cert_file, &dest) {
            warn!("Failed to copy root certificate to {}: {}", dest.display(), e);
            return None;
        }
        if self.runner.succeeds("update-ca-certificates", &[]) {
            Some(dest)
        } else {
            warn!("update-ca-certificates failed for the SYSTEM certificate");
            None
        }
    }

    fn trust_using_trust_anchor(&self, candidates: &[&Path]) -> bool {
        if !self.has_trust_anchor() {
            warn!("Skipping SYSTEM install using trust anchor, command missing");
            return false;
        }
        for file in candidates.iter().filter(|f| f.exists()) {
            let path = file.to_string_lossy();
            if self.runner.succeeds("trust", &["anchor", "--store", &path]) {
                return true;
            }
            warn!("trust anchor --store failed for {}", path);
        }
        false
    }

    /// Certificates trusted by p11-kit whose subject email marks them as ours
    fn find_using_trust_anchor(&self) -> Vec<String> {
        let extract = std::env::temp_dir().join(format!(
            "trust-extract-for-{}-{}.pem",
            self.identity.file_stem,
            std::process::id()
        ));
        // trust extract refuses to overwrite
        let _ = fs::remove_file(&extract);
        let path = extract.to_string_lossy().into_owned();

        let mut uris = Vec::new();
        if self
            .runner
            .succeeds("trust", &["extract", "--format", "pem-bundle", &path])
        {
            match fs::read(&extract).map(|pem| X509::stack_from_pem(&pem)) {
                Ok(Ok(certs)) => {
                    for cert in certs.iter().filter(|c| email_matches(c, &self.identity.email)) {
                        if let Some(skid) = cert.subject_key_id() {
                            let uri = pkcs11_uri(skid.as_slice());
                            info!("Found matching certificate: {}", uri);
                            uris.push(uri);
                        }
                    }
                }
                Ok(Err(e)) => warn!("Could not parse trust anchor bundle: {}", e),
                Err(e) => warn!("Could not read trust anchor bundle: {}", e),
            }
        }
        let _ = fs::remove_file(&extract);
        uris
    }
}

/// p11-kit URI for a subject key identifier, e.g. `pkcs11:id=%7C%5D;type=cert`
pub fn pkcs11_uri(key_id: &[u8]) -> String {
    let encoded: String = key_id.iter().map(|b| format!("%{:02X}", b)).collect();
    format!("{}{};type=cert", PKCS11_ID_PREFIX, encoded)
}

fn nss_url(db: &Path) -> String {
    format!("sql:{}", db.display())
}

impl NativeTrustStore for LinuxTrustStore {
    fn name(&self) -> &'static str {
        match self.privilege {
            PrivilegeLevel::System => "update-ca-certificates/trust",
            PrivilegeLevel::User => "certutil",
        }
    }

    fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    fn add(&self, cert_file: &Path) -> bool {
        match self.privilege {
            PrivilegeLevel::System => {
                let copied = self.trust_using_update_ca_certificates(cert_file);
                let mut candidates: Vec<&Path> = Vec::new();
                if let Some(copied) = copied.as_deref() {
                    candidates.push(copied);
                }
                candidates.push(cert_file);
                let anchored = self.trust_using_trust_anchor(&candidates);
                copied.is_some() || anchored
            }
            PrivilegeLevel::User => {
                let file = cert_file.to_string_lossy();
                let mut success = true;
                for db in self.nss_databases() {
                    let url = nss_url(&db);
                    let added = self.runner.succeeds(
                        "certutil",
                        &["-d", &url, "-A", "-t", "TC", "-n", &self.identity.organization, "-i", &file],
                    );
                    if !added {
                        warn!("Could not add certificate to {}; some browsers will reject HTTPS", url);
                        success = false;
                    }
                }
                success
            }
        }
    }

    fn remove(&self, identifiers: &[String]) -> bool {
        match self.privilege {
            PrivilegeLevel::System => {
                let mut deleted = false;
                for id in identifiers.iter().filter(|id| !id.starts_with(PKCS11_ID_PREFIX)) {
                    let file = Path::new(id);
                    if file.is_file() && fs::remove_file(file).is_ok() {
                        deleted = true;
                    } else {
                        warn!("SYSTEM certificate {} does not exist, skipping", id);
                    }
                }
                let updated = deleted && self.runner.succeeds("update-ca-certificates", &[]);

                let mut anchors_removed = false;
                for id in identifiers.iter().filter(|id| id.starts_with(PKCS11_ID_PREFIX)) {
                    if self.runner.succeeds("trust", &["anchor", "--remove", id]) {
                        anchors_removed = true;
                    } else {
                        warn!("trust anchor --remove failed for {}", id);
                    }
                }
                updated || anchors_removed
            }
            PrivilegeLevel::User => {
                let mut success = true;
                for nickname in identifiers {
                    for db in self.nss_databases() {
                        let url = nss_url(&db);
                        success &= self.runner.succeeds("certutil", &["-d", &url, "-D", "-n", nickname]);
                    }
                }
                success
            }
        }
    }

    fn find(&self) -> Vec<String> {
        match self.privilege {
            PrivilegeLevel::System => {
                let mut found = self.find_using_trust_anchor();
                let file = self.system_cert_file();
                if file.is_file() {
                    found.push(file.to_string_lossy().into_owned());
                }
                found
            }
            PrivilegeLevel::User => {
                let prefix = format!("{} ", self.identity.organization);
                let mut found = Vec::new();
                for db in self.nss_databases() {
                    let url = nss_url(&db);
                    let listed = self
                        .runner
                        .stdout_of("certutil", &["-d", &url, "-L"])
                        .unwrap_or_default();
                    if listed.lines().any(|line| line.starts_with(&prefix))
                        && !found.contains(&self.identity.organization)
                    {
                        found.push(self.identity.organization.clone());
                    }
                }
                found
            }
        }
    }

    /// No reliable check exists; assume installed
    fn verify(&self, _cert_file: &Path) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native_installer::test_support::{identity, root_pem};
    use crate::shell::fake::FakeRunner;
    use crate::shell::CommandOutput;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[test]
    fn test_pkcs11_uri_encoding() {
        assert_eq!(pkcs11_uri(&[0x7c, 0x5d, 0x02]), "pkcs11:id=%7C%5D%02;type=cert");
    }

    #[test]
    fn test_system_install_replaces_previous_copy() {
        let dir = TempDir::new().unwrap();
        let ca_dir = dir.path().join("ca-certificates");
        fs::create_dir(&ca_dir).unwrap();
        let cert = root_pem(dir.path());

        let runner = Arc::new(FakeRunner::new(|program, args| match (program, args) {
            ("trust", ["extract", ..]) => CommandOutput::failed("no p11-kit"),
            ("trust", _) => CommandOutput::failed("trust: command not found"),
            _ => CommandOutput::ok(""),
        }));
        let store = LinuxTrustStore::new(PrivilegeLevel::System, identity(), runner.clone())
            .with_ca_dir(ca_dir.clone());

        assert!(store.install(&cert));
        assert!(store.install(&cert));

        let installed: Vec<_> = fs::read_dir(&ca_dir).unwrap().collect();
        assert_eq!(installed.len(), 1);
        assert!(ca_dir.join("localgate-root.crt").is_file());
        assert!(runner
            .calls()
            .iter()
            .any(|c| c == "update-ca-certificates "));
    }

    #[test]
    fn test_trust_anchor_entries_found_by_email() {
        let dir = TempDir::new().unwrap();
        let cert = root_pem(dir.path());
        let pem = fs::read(&cert).unwrap();
        let skid = X509::from_pem(&pem)
            .unwrap()
            .subject_key_id()
            .unwrap()
            .as_slice()
            .to_vec();

        let runner = Arc::new(FakeRunner::new(move |program, args| {
            if program == "trust" && args.first() == Some(&"extract") {
                fs::write(args[3], &pem).unwrap();
            }
            CommandOutput::ok("")
        }));
        let store = LinuxTrustStore::new(PrivilegeLevel::System, identity(), runner)
            .with_ca_dir(dir.path().join("missing"));

        assert_eq!(store.find(), vec![pkcs11_uri(&skid)]);
    }

    #[test]
    fn test_user_install_only_touches_existing_databases() {
        let home = TempDir::new().unwrap();
        let db = home.path().join(".pki/nssdb");
        fs::create_dir_all(&db).unwrap();
        let cert = root_pem(home.path());

        let listed = Arc::new(Mutex::new(false));
        let state = listed.clone();
        let runner = Arc::new(FakeRunner::new(move |_, args| {
            let mut present = state.lock().unwrap();
            match args.get(2).copied() {
                Some("-A") => *present = true,
                Some("-D") => *present = false,
                Some("-L") if *present => return CommandOutput::ok("Localgate    C,,\n"),
                _ => {}
            }
            CommandOutput::ok("")
        }));
        let store = LinuxTrustStore::new(PrivilegeLevel::User, identity(), runner.clone())
            .with_home(home.path().to_path_buf());

        assert!(store.install(&cert));
        assert_eq!(store.find(), vec!["Localgate".to_string()]);
        assert!(store.install(&cert));

        let expected_db = format!("sql:{}", db.display());
        let calls = runner.calls();
        assert!(calls.iter().all(|c| c.contains(&expected_db)));
        assert_eq!(calls.iter().filter(|c| c.contains(" -D ")).count(), 1);
        assert!(*listed.lock().unwrap());
    }
}
