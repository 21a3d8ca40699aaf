//! macOS keychains via the `security` tool.

use std::path::Path;
use std::sync::Arc;

use super::{NativeTrustStore, PrivilegeLevel, StoreIdentity};
use crate::platform::home_dir;
use crate::shell::CommandRunner;

pub const SYSTEM_KEYCHAIN: &str = "/Library/Keychains/System.keychain";
const USER_KEYCHAIN: &str = "Library/Keychains/login.keychain";

pub struct MacTrustStore {
    privilege: PrivilegeLevel,
    identity: StoreIdentity,
    runner: Arc<dyn CommandRunner>,
    keychain: String,
}

impl MacTrustStore {
    pub fn new(privilege: PrivilegeLevel, identity: StoreIdentity, runner: Arc<dyn CommandRunner>) -> Self {
        let keychain = match privilege {
            PrivilegeLevel::User => home_dir().join(USER_KEYCHAIN).to_string_lossy().into_owned(),
            PrivilegeLevel::System => SYSTEM_KEYCHAIN.to_string(),
        };
        Self {
            privilege,
            identity,
            runner,
            keychain,
        }
    }

    pub fn keychain(&self) -> &str {
        &self.keychain
    }
}

/// SHA-1 hashes from `security find-certificate -Z` output
pub fn parse_sha1_hashes(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.contains("SHA-1"))
        .filter_map(|line| line.split_once(':'))
        .map(|(_, hash)| hash.trim().to_string())
        .filter(|hash| !hash.is_empty())
        .collect()
}

impl NativeTrustStore for MacTrustStore {
    fn name(&self) -> &'static str {
        "security"
    }

    fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    fn add(&self, cert_file: &Path) -> bool {
        let file = cert_file.to_string_lossy();
        match self.privilege {
            // prompts the user for their login password
            PrivilegeLevel::User => self.runner.succeeds(
                "security",
                &["add-trusted-cert", "-r", "trustRoot", "-k", &self.keychain, &file],
            ),
            PrivilegeLevel::System => self.runner.succeeds(
                "security",
                &["add-trusted-cert", "-d", "-r", "trustRoot", "-k", &self.keychain, &file],
            ),
        }
    }

    fn remove(&self, identifiers: &[String]) -> bool {
        identifiers.iter().all(|hash| {
            self.runner
                .succeeds("security", &["delete-certificate", "-Z", hash, &self.keychain])
        })
    }

    fn find(&self) -> Vec<String> {
        self.runner
            .stdout_of(
                "security",
                &["find-certificate", "-e", &self.identity.email, "-Z", &self.keychain],
            )
            .map(|out| parse_sha1_hashes(&out))
            .unwrap_or_default()
    }

    fn verify(&self, cert_file: &Path) -> bool {
        self.runner
            .succeeds("security", &["verify-cert", "-c", &cert_file.to_string_lossy()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native_installer::test_support::identity;
    use crate::shell::fake::FakeRunner;
    use crate::shell::CommandOutput;
    use std::sync::Mutex;

    const FIND_OUTPUT: &str = "SHA-256 hash: 5C0D1A...\nSHA-1 hash: 8A7B6C5D4E3F2A1B0C9D8E7F6A5B4C3D2E1F0A9B\nkeychain: \"/Library/Keychains/System.keychain\"\nversion: 512\n";

    #[test]
    fn test_parse_sha1_hashes() {
        assert_eq!(
            parse_sha1_hashes(FIND_OUTPUT),
            vec!["8A7B6C5D4E3F2A1B0C9D8E7F6A5B4C3D2E1F0A9B".to_string()]
        );
        assert!(parse_sha1_hashes("").is_empty());
    }

    #[test]
    fn test_system_install_replaces_previous_entry() {
        let installed = Arc::new(Mutex::new(1usize));
        let state = installed.clone();
        let runner = Arc::new(FakeRunner::new(move |_, args| {
            let mut count = state.lock().unwrap();
            match args[0] {
                "find-certificate" => {
                    CommandOutput::ok(FIND_OUTPUT.repeat(*count))
                }
                "delete-certificate" => {
                    *count -= 1;
                    CommandOutput::ok("")
                }
                "add-trusted-cert" => {
                    *count += 1;
                    CommandOutput::ok("")
                }
                _ => CommandOutput::failed("unexpected"),
            }
        }));
        let store = MacTrustStore::new(PrivilegeLevel::System, identity(), runner.clone());

        assert!(store.install(Path::new("/tmp/root-ca.crt")));
        assert_eq!(*installed.lock().unwrap(), 1);
        assert!(runner.calls().contains(
            &"security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain /tmp/root-ca.crt"
                .to_string()
        ));
        assert!(runner.calls()[0].contains("-e trust@localgate.dev"));
    }
}
