//! Browser trust installation for browsers that ignore the OS store
//!
//! Firefox and its forks keep their own certificate database. Newer releases
//! read an enterprise policy file that tells them to import the OS roots;
//! older ones only honour a legacy auto-config script carrying the certificate
//! bytes. [`BrowserTrustInstaller`] locates every installed family member and
//! picks the strategy from the detected version against a per-OS threshold.

pub mod autoconfig;
pub mod locator;
pub mod policy;

use openssl::x509::X509Ref;
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::platform::Platform;
use locator::BrowserLocator;

/// Known Firefox family members; `vendor` is only used for registry lookups
pub const FIREFOX_ALIASES: [BrowserAlias; 6] = [
    BrowserAlias { vendor: None, name: "Firefox" },
    BrowserAlias { vendor: Some("Mozilla"), name: "Mozilla Firefox" },
    BrowserAlias { vendor: Some("Mozilla"), name: "SeaMonkey" },
    BrowserAlias { vendor: Some("Mozilla"), name: "Waterfox" },
    BrowserAlias { vendor: Some("Mozilla"), name: "Pale Moon" },
    BrowserAlias { vendor: Some("Mozilla"), name: "IceCat" },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserAlias {
    pub vendor: Option<&'static str>,
    pub name: &'static str,
}

impl BrowserAlias {
    /// Executable name on Linux, e.g. `Pale Moon` -> `palemoon`
    pub fn posix(&self) -> String {
        self.name.replace(' ', "").to_lowercase()
    }

    /// Name without the vendor prefix, e.g. `Mozilla Firefox` -> `Firefox`
    pub fn short_name(&self) -> &'static str {
        match self.vendor {
            Some(vendor) => self
                .name
                .strip_prefix(vendor)
                .map(str::trim)
                .unwrap_or(self.name),
            None => self.name,
        }
    }

    pub fn matches(&self, app_name: &str) -> bool {
        self.name.eq_ignore_ascii_case(app_name.trim())
    }
}

/// Three component browser version with optional build metadata (`esr`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: Option<String>,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: None,
        }
    }

    /// Parse `115.3.1esr`, `56.0` or `60`; missing components are zero
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let numeric: String = text
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        let build = text[numeric.len()..].trim_start_matches(['-', '+']);

        let mut parts = numeric.split('.').filter(|p| !p.is_empty());
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
        Some(Self {
            major,
            minor,
            patch,
            build: (!build.is_empty()).then(|| build.to_string()),
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch).cmp(&(other.major, other.minor, other.patch))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(build) = &self.build {
            write!(f, "+{}", build)?;
        }
        Ok(())
    }
}

/// First release per OS that reads enterprise policies
pub fn policy_threshold(platform: Platform) -> Version {
    match platform {
        Platform::Windows => Version::new(62, 0, 0),
        Platform::MacOs => Version::new(63, 0, 0),
        Platform::Linux => Version::new(65, 0, 0),
    }
}

/// One installed browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowserInstall {
    pub alias: BrowserAlias,
    /// Install directory; policy and auto-config paths are relative to it
    pub path: PathBuf,
    pub exe_path: PathBuf,
    pub version: Option<Version>,
}

impl BrowserInstall {
    pub fn new(alias: BrowserAlias, exe_path: PathBuf, version: Option<Version>) -> Self {
        let path = exe_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| exe_path.clone());
        Self {
            alias,
            path,
            exe_path,
            version,
        }
    }

    pub fn with_path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    pub fn honors_policy(&self, platform: Platform) -> bool {
        match &self.version {
            Some(version) => *version >= policy_threshold(platform),
            None => {
                warn!("{} found at {} without version information", self.alias.name, self.path.display());
                false
            }
        }
    }
}

impl fmt::Display for BrowserInstall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(v) => write!(f, "{} {} ({})", self.alias.name, v, self.path.display()),
            None => write!(f, "{} ({})", self.alias.name, self.path.display()),
        }
    }
}

pub struct BrowserTrustInstaller {
    platform: Platform,
    locator: Box<dyn BrowserLocator>,
    policy_paths: policy::PolicyPaths,
}

impl BrowserTrustInstaller {
    pub fn new(platform: Platform, locator: Box<dyn BrowserLocator>) -> Self {
        Self {
            platform,
            locator,
            policy_paths: policy::PolicyPaths::default(),
        }
    }

    pub fn with_policy_paths(mut self, policy_paths: policy::PolicyPaths) -> Self {
        self.policy_paths = policy_paths;
        self
    }

    /// Push `root` into every located browser; returns how many succeeded
    pub fn install(&self, root: &X509Ref, host_names: &[String]) -> usize {
        let mut installed = 0;
        for app in self.locator.locate() {
            let result = if app.honors_policy(self.platform) {
                info!("Installing enterprise certificate policy for {}", app);
                policy::install(self.platform, &app, root, &self.policy_paths)
            } else {
                info!("Installing auto-config script for {}", app);
                autoconfig::install(self.platform, &app, root, host_names)
            };
            match result {
                Ok(()) => installed += 1,
                Err(e) => warn!("Could not install certificate trust for {}: {:#}", app, e),
            }
        }
        installed
    }

    /// Revert auto-config installs; enterprise policies stay in place
    pub fn uninstall(&self) -> usize {
        let mut removed = 0;
        for app in self.locator.locate() {
            if app.honors_policy(self.platform) {
                info!("Leaving enterprise certificate policy in place for {}", app);
                continue;
            }
            info!("Uninstalling auto-config script for {}", app);
            match autoconfig::uninstall(self.platform, &app) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not uninstall auto-config for {}: {:#}", app, e),
            }
        }
        removed
    }
}
