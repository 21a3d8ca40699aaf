//! Windows Root store via `certutil.exe`.

use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use super::{NativeTrustStore, PrivilegeLevel, StoreIdentity};
use crate::shell::CommandRunner;

pub struct WindowsTrustStore {
    privilege: PrivilegeLevel,
    identity: StoreIdentity,
    runner: Arc<dyn CommandRunner>,
}

impl WindowsTrustStore {
    pub fn new(privilege: PrivilegeLevel, identity: StoreIdentity, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            privilege,
            identity,
            runner,
        }
    }

    /// certutil arguments with `-user` inserted after the verb for USER stores
    fn args<'a>(&self, verb: &'a str, rest: &[&'a str]) -> Vec<&'a str> {
        let mut args = vec![verb];
        if self.privilege == PrivilegeLevel::User {
            args.push("-user");
        }
        args.extend_from_slice(rest);
        args
    }
}

/// Serial numbers of Root store entries whose issuer carries `OU=<organization>`
///
/// `certutil -store` prints each entry after a `====` separator, serial first,
/// issuer on the following line.
pub fn parse_store_serials(output: &str, organization: &str) -> Vec<String> {
    let marker = format!("OU={}", organization);
    let mut serials = Vec::new();
    let mut lines = output.lines();
    while let Some(line) = lines.next() {
        if !line.contains("================") {
            continue;
        }
        let serial = lines.next().and_then(value_after_colon);
        let issuer = lines.next().and_then(value_after_colon);
        if let (Some(serial), Some(issuer)) = (serial, issuer) {
            if issuer.contains(&marker) {
                serials.push(serial);
            }
        }
    }
    serials
}

/// First `dwErrorStatus=` value of `certutil -verify` output; `0` means trusted
pub fn parse_error_status(output: &str) -> Option<bool> {
    output
        .split_whitespace()
        .find_map(|part| part.strip_prefix("dwErrorStatus="))
        .map(|status| status.trim() == "0")
}

fn value_after_colon(line: &str) -> Option<String> {
    line.split_once(':').map(|(_, v)| v.trim().to_string())
}

impl NativeTrustStore for WindowsTrustStore {
    fn name(&self) -> &'static str {
        "certutil"
    }

    fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    fn add(&self, cert_file: &Path) -> bool {
        let file = cert_file.to_string_lossy().into_owned();
        let mut args = vec!["-addstore", "-f"];
        if self.privilege == PrivilegeLevel::User {
            // prompts the user
            args.push("-user");
        }
        args.push("Root");
        args.push(file.as_str());
        self.runner.succeeds("certutil.exe", &args)
    }

    fn remove(&self, identifiers: &[String]) -> bool {
        identifiers.iter().all(|serial| {
            self.runner
                .succeeds("certutil.exe", &self.args("-delstore", &["Root", serial]))
        })
    }

    fn find(&self) -> Vec<String> {
        match self
            .runner
            .stdout_of("certutil.exe", &self.args("-store", &["Root"]))
        {
            Some(out) => parse_store_serials(&out, &self.identity.organization),
            None => {
                info!("No trusted root matching OU={} found", self.identity.organization);
                Vec::new()
            }
        }
    }

    fn verify(&self, cert_file: &Path) -> bool {
        // -user also consults the machine Root store
        let output = self
            .runner
            .run("certutil", &["-user", "-verify", &cert_file.to_string_lossy()]);
        match output.ok().and_then(|out| parse_error_status(&out.stdout)) {
            Some(trusted) => {
                info!("Certificate validity check reports trusted={}", trusted);
                trusted
            }
            None => {
                warn!("Unable to determine certificate validity; trust will be reinstalled");
                false
            }
        }
    }
}
