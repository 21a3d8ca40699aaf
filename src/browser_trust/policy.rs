//! Enterprise policy (`distribution/policies.json`) for policy-aware browsers.
//!
//! Windows and macOS builds are told to import the OS enterprise roots. Linux
//! has no such concept, so the root is copied to a readable location and
//! listed under `Certificates.Install`. Existing policies are merged, never
//! replaced.

use anyhow::{anyhow, Context, Result};
use openssl::x509::X509Ref;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::BrowserInstall;
use crate::certificate_manager::APP_NAME;
use crate::platform::Platform;

pub const DISTRIBUTION_POLICY_LOCATION: &str = "distribution/policies.json";
pub const MAC_DISTRIBUTION_POLICY_LOCATION: &str = "Contents/Resources/distribution/policies.json";

/// Machine wide locations used by Linux installs
#[derive(Debug, Clone)]
pub struct PolicyPaths {
    /// Snap packaged browsers only read this policy file
    pub global_policy: PathBuf,
    /// Certificate copy readable from inside the snap confinement
    pub snap_certificate: PathBuf,
    /// Default certificate search path for non-snap installs
    pub global_certificate: PathBuf,
}

impl Default for PolicyPaths {
    fn default() -> Self {
        Self {
            global_policy: PathBuf::from("/etc/firefox/policies/policies.json"),
            snap_certificate: PathBuf::from(format!("/etc/firefox/policies/{}.crt", APP_NAME)),
            global_certificate: PathBuf::from(format!("/usr/lib/mozilla/certificates/{}.crt", APP_NAME)),
        }
    }
}

pub fn policy_file(platform: Platform, app: &BrowserInstall, paths: &PolicyPaths) -> PathBuf {
    if app.path.starts_with("/snap") {
        info!("Snap detected, using global policy location {}", paths.global_policy.display());
        return paths.global_policy.clone();
    }
    match platform {
        Platform::MacOs => app.path.join(MAC_DISTRIBUTION_POLICY_LOCATION),
        _ => app.path.join(DISTRIBUTION_POLICY_LOCATION),
    }
}

pub fn install(platform: Platform, app: &BrowserInstall, root: &X509Ref, paths: &PolicyPaths) -> Result<()> {
    let json_path = policy_file(platform, app, paths);

    let certificates = match platform {
        Platform::Windows | Platform::MacOs => json!({ "ImportEnterpriseRoots": true }),
        Platform::Linux => {
            write_readable_certificate(root, &paths.snap_certificate)?;
            write_readable_certificate(root, &paths.global_certificate)?;
            json!({
                "Install": [
                    format!("{}.crt", APP_NAME),
                    paths.snap_certificate.to_string_lossy(),
                ]
            })
        }
    };

    if let Some(parent) = json_path.parent() {
        fs::create_dir_all(parent)
            .context(format!("Failed to create policy directory {}", parent.display()))?;
    }
    let existing = read_policies(&json_path)?;
    let merged = merge_certificate_policy(existing, certificates)?;
    let text = serde_json::to_string_pretty(&merged)
        .map_err(|e| anyhow!("Failed to encode policy: {}", e))?;
    fs::write(&json_path, text).context(format!("Failed to write policy {}", json_path.display()))?;
    info!("Wrote certificate policy {}", json_path.display());
    Ok(())
}

fn read_policies(path: &Path) -> Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let text = fs::read_to_string(path).context(format!("Failed to read policy {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(&text).map_err(|e| anyhow!("Malformed policy file {}: {}", path.display(), e))
}

/// Merge `certificates` into `policies.Certificates`, keeping everything else
///
/// `Install` lists are unioned; entries this application wrote before are
/// replaced rather than duplicated.
pub fn merge_certificate_policy(mut document: Value, certificates: Value) -> Result<Value> {
    let root = document
        .as_object_mut()
        .ok_or_else(|| anyhow!("Policy document is not a JSON object"))?;
    let policies = object_entry(root, "policies")?;
    let target = object_entry(policies, "Certificates")?;

    let Value::Object(additions) = certificates else {
        return Err(anyhow!("Certificate policy must be a JSON object"));
    };
    for (key, value) in additions {
        match (key.as_str(), value) {
            ("Install", Value::Array(ours)) => {
                let own_name = format!("{}.crt", APP_NAME);
                let mut merged: Vec<Value> = match target.remove("Install") {
                    Some(Value::Array(existing)) => existing
                        .into_iter()
                        .filter(|v| !v.as_str().is_some_and(|s| s.ends_with(&own_name)))
                        .collect(),
                    _ => Vec::new(),
                };
                merged.extend(ours);
                target.insert(key, Value::Array(merged));
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
    Ok(document)
}

fn object_entry<'a>(map: &'a mut Map<String, Value>, key: &str) -> Result<&'a mut Map<String, Value>> {
    map.entry(key.to_string())
        .or_insert_with(|| json!({}))
        .as_object_mut()
        .ok_or_else(|| anyhow!("Policy entry \"{}\" is not a JSON object", key))
}

fn write_readable_certificate(root: &X509Ref, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(format!("Failed to create {}", parent.display()))?;
    }
    let pem = root
        .to_pem()
        .map_err(|e| anyhow!("Failed to encode root certificate: {}", e))?;
    fs::write(path, pem).context(format!("Failed to write {}", path.display()))?;
    set_world_readable(path);
    Ok(())
}

#[cfg(unix)]
fn set_world_readable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o644)) {
        tracing::warn!("Could not make {} world readable: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn set_world_readable(_path: &Path) {}
