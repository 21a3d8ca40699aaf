//! Native trust-store installation
//!
//! One [`NativeTrustStore`] implementation per operating system installs,
//! finds, removes and verifies the local root certificate. The platform is
//! picked once at startup by [`for_platform`]; callers only see the trait.
//!
//! Every install first removes whatever [`NativeTrustStore::find`] reports, so
//! repeated installs leave exactly one entry for this application behind.
//! Failures are reported as `false` and logged, never propagated: without a
//! trusted root the gateway still runs, browsers just warn about the
//! certificate.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxTrustStore;
pub use macos::MacTrustStore;
pub use windows::WindowsTrustStore;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::certificate_chain_builder::CertificateIdentity;
use crate::certificate_manager::APP_NAME;
use crate::platform::Platform;
use crate::shell::CommandRunner;

/// Which trust store an installer writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    User,
    System,
}

impl PrivilegeLevel {
    /// System level when running as root/Administrator, user level otherwise
    pub fn detect(platform: Platform, runner: &dyn CommandRunner) -> Self {
        let elevated = match platform {
            Platform::Windows => runner.succeeds("net", &["session"]),
            Platform::Linux | Platform::MacOs => runner
                .stdout_of("id", &["-u"])
                .map(|uid| uid.trim() == "0")
                .unwrap_or(false),
        };
        if elevated {
            PrivilegeLevel::System
        } else {
            PrivilegeLevel::User
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeLevel::User => write!(f, "USER"),
            PrivilegeLevel::System => write!(f, "SYSTEM"),
        }
    }
}

/// How entries belonging to this application are recognised in a store
#[derive(Debug, Clone)]
pub struct StoreIdentity {
    pub organization: String,
    pub email: String,
    pub file_stem: String,
}

impl StoreIdentity {
    pub fn from_certificate_identity(identity: &CertificateIdentity) -> Self {
        Self {
            organization: identity.organization.clone(),
            email: identity.email.clone(),
            file_stem: APP_NAME.to_string(),
        }
    }
}

pub trait NativeTrustStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn privilege(&self) -> PrivilegeLevel;

    /// Add the PEM certificate in `cert_file` as a trusted root
    fn add(&self, cert_file: &Path) -> bool;

    /// Remove the entries named by identifiers previously returned from `find`
    fn remove(&self, identifiers: &[String]) -> bool;

    /// Identifiers of entries in the store issued by this application
    fn find(&self) -> Vec<String>;

    /// Whether the OS currently trusts `cert_file`
    fn verify(&self, cert_file: &Path) -> bool;

    /// Replace any previous install with `cert_file`
    fn install(&self, cert_file: &Path) -> bool {
        let store = self.privilege();
        let stale = self.find();
        if stale.is_empty() || self.remove(&stale) {
            if !stale.is_empty() {
                info!("Certificate removed from {} store using {}", store, self.name());
            }
        } else {
            warn!("Could not remove certificate from {} store using {}", store, self.name());
        }

        if self.add(cert_file) {
            info!("Certificate added to {} store using {}", store, self.name());
            true
        } else {
            warn!("Could not install certificate to {} store using {}", store, self.name());
            false
        }
    }

    /// Remove every entry issued by this application
    fn uninstall(&self) -> bool {
        let found = self.find();
        found.is_empty() || self.remove(&found)
    }
}

pub fn for_platform(
    platform: Platform,
    privilege: PrivilegeLevel,
    identity: StoreIdentity,
    runner: Arc<dyn CommandRunner>,
) -> Box<dyn NativeTrustStore> {
    match platform {
        Platform::Linux => Box::new(LinuxTrustStore::new(privilege, identity, runner)),
        Platform::MacOs => Box::new(MacTrustStore::new(privilege, identity, runner)),
        Platform::Windows => Box::new(WindowsTrustStore::new(privilege, identity, runner)),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    AlreadyTrusted,
    Installed,
    /// Automatic install failed; the user has to import this file by hand
    ManualInstallRequired(PathBuf),
    Failed,
}

/// Install `cert_file` unless the store already trusts it
///
/// `force` skips the verify shortcut, used right after a new root was generated.
pub fn ensure_trusted(store: &dyn NativeTrustStore, cert_file: &Path, force: bool) -> InstallOutcome {
    if !force && store.verify(cert_file) {
        info!("Root certificate is already trusted by the {} store", store.privilege());
        return InstallOutcome::AlreadyTrusted;
    }
    if store.install(cert_file) {
        return InstallOutcome::Installed;
    }
    match store.privilege() {
        PrivilegeLevel::User => {
            warn!(
                "Automatic trust installation failed. Import {} into your trusted root \
                 certificates manually, or secure connections will show a warning.",
                cert_file.display()
            );
            InstallOutcome::ManualInstallRequired(cert_file.to_path_buf())
        }
        PrivilegeLevel::System => InstallOutcome::Failed,
    }
}
