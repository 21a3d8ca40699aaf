//! Legacy auto-config install for browsers older than the policy threshold.
//!
//! Two files are written into the install directory: a preference file under
//! `defaults/pref` pointing the browser at our config script, and the script
//! itself, which imports the base64 certificate whenever its timestamp is newer
//! than the one recorded in the profile.

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use openssl::x509::X509Ref;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use super::BrowserInstall;
use crate::certificate_chain_builder::normalize_hosts;
use crate::certificate_manager::APP_NAME;
use crate::generate_root_ca::now_millis;
use crate::platform::Platform;

const PREFS_DIR: &str = "defaults/pref";
const MAC_PREFIX: &str = "Contents/Resources";
const CONFIG_PREF: &str = "general.config.filename";

/// The browser skips the first line of the script, it must stay a comment
const CONFIG_TEMPLATE: &str = r#"//%APP_NAME% auto-config, rewritten on every install
var serviceName = "%APP_NAME%";
var certData = "%CERT_DATA%";
var commonName = "%COMMON_NAME%";
var timestamp = %TIMESTAMP%;
var uninstall = %UNINSTALL%;

try {
    var certdb = Components.classes["@mozilla.org/security/x509certdb;1"]
        .getService(Components.interfaces.nsIX509CertDB);
    var stampPref = serviceName + ".certificate.timestamp";
    var installed = -1;
    try { installed = getPref(stampPref); } catch (ignore) {}

    if (uninstall) {
        var certs = certdb.getCerts();
        for (var i = 0; i < certs.length; i++) {
            if (certs[i].commonName == commonName) {
                certdb.deleteCertificate(certs[i]);
            }
        }
        pref(stampPref, -1);
    } else if (timestamp > installed) {
        certdb.addCertFromBase64(certData, "C,C,C", "");
        pref(stampPref, timestamp);
    }
} catch (e) {
    displayError(serviceName + " certificate auto-config", e);
}
"#;

pub fn prefs_file_name() -> String {
    format!("{}.js", APP_NAME)
}

pub fn config_file_name() -> String {
    format!("{}.cfg", APP_NAME)
}

fn base_dir(platform: Platform, app: &BrowserInstall) -> PathBuf {
    match platform {
        Platform::MacOs => app.path.join(MAC_PREFIX),
        _ => app.path.clone(),
    }
}

pub fn install(platform: Platform, app: &BrowserInstall, root: &X509Ref, host_names: &[String]) -> Result<()> {
    if app.path == Path::new("/usr/bin") {
        bail!("Refusing to install auto-config into /usr/bin");
    }
    let der = root
        .to_der()
        .map_err(|e| anyhow!("Failed to encode root certificate: {}", e))?;
    let base = base_dir(platform, app);
    write_prefs_file(&base)?;
    let hosts = normalize_hosts(host_names);
    write_config(&base, &STANDARD.encode(der), &hosts[0], now_millis()?.to_string(), false)
}

/// Rewrite the script so the next browser start removes the certificate
pub fn uninstall(platform: Platform, app: &BrowserInstall) -> Result<()> {
    let base = base_dir(platform, app);
    let hosts = normalize_hosts(&[]);
    write_config(&base, "", &hosts[0], "-1".to_string(), true)
}

fn write_prefs_file(base: &Path) -> Result<()> {
    let prefs_dir = base.join(PREFS_DIR);
    fs::create_dir_all(&prefs_dir)
        .context(format!("Failed to create {}", prefs_dir.display()))?;

    let own_config = config_file_name();
    let entries = fs::read_dir(&prefs_dir)
        .context(format!("Failed to list {}", prefs_dir.display()))?;
    for entry in entries.flatten() {
        let Ok(text) = fs::read_to_string(entry.path()) else {
            continue;
        };
        if let Some(line) = text
            .lines()
            .find(|l| l.contains(CONFIG_PREF) && !l.contains(&own_config))
        {
            bail!(
                "Browser already defines {} in {}: {}",
                CONFIG_PREF,
                entry.path().display(),
                line.trim()
            );
        }
    }

    let prefs_file = prefs_dir.join(prefs_file_name());
    let contents = format!(
        "pref('{}', '{}');\npref('general.config.obscure_value', 0);\n",
        CONFIG_PREF, own_config
    );
    fs::write(&prefs_file, contents).context(format!("Failed to write {}", prefs_file.display()))
}

fn write_config(base: &Path, cert_data: &str, common_name: &str, timestamp: String, uninstall: bool) -> Result<()> {
    if !base.is_dir() {
        bail!("Directory does not exist or is not writable: {}", base.display());
    }
    let script = CONFIG_TEMPLATE
        .replace("%APP_NAME%", APP_NAME)
        .replace("%CERT_DATA%", cert_data)
        .replace("%COMMON_NAME%", common_name)
        .replace("%TIMESTAMP%", &timestamp)
        .replace("%UNINSTALL%", if uninstall { "true" } else { "false" });
    let dest = base.join(config_file_name());
    fs::write(&dest, script).context(format!("Failed to write {}", dest.display()))?;
    info!("Wrote auto-config script {}", dest.display());
    Ok(())
}
