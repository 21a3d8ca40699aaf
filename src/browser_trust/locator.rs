//! Discovery of installed Firefox family browsers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{BrowserAlias, BrowserInstall, Version, FIREFOX_ALIASES};
use crate::platform::Platform;
use crate::shell::CommandRunner;

pub trait BrowserLocator: Send + Sync {
    fn locate(&self) -> Vec<BrowserInstall>;
}

pub fn for_platform(platform: Platform, runner: Arc<dyn CommandRunner>) -> Box<dyn BrowserLocator> {
    match platform {
        Platform::Linux => Box::new(LinuxLocator::new(runner)),
        Platform::MacOs => Box::new(MacLocator::new()),
        Platform::Windows => Box::new(WindowsLocator::new(runner)),
    }
}

/// Last whitespace separated token of `firefox --version` output
///
/// `Mozilla Firefox 115.3.1esr` parses to `115.3.1` with build `esr`.
pub fn parse_version_output(output: &str) -> Option<Version> {
    let line = output.lines().next()?.trim();
    Version::parse(line.split_whitespace().last()?)
}

pub struct LinuxLocator {
    runner: Arc<dyn CommandRunner>,
    search_path: Vec<PathBuf>,
}

impl LinuxLocator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        let search_path = std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).collect())
            .unwrap_or_default();
        Self { runner, search_path }
    }

    pub fn with_search_path(mut self, search_path: Vec<PathBuf>) -> Self {
        self.search_path = search_path;
        self
    }

    /// PATH plus the Fedora style `/usr/lib{,64}/<name>/bin` locations
    fn candidate_dirs(&self, posix: &str) -> Vec<PathBuf> {
        let mut dirs = self.search_path.clone();
        dirs.push(PathBuf::from(format!("/usr/lib/{}/bin", posix)));
        dirs.push(PathBuf::from(format!("/usr/lib64/{}/bin", posix)));
        dirs
    }

    fn resolve_executable(&self, found: &Path, posix: &str) -> Option<PathBuf> {
        let canonical = fs::canonicalize(found).unwrap_or_else(|_| found.to_path_buf());
        // snaps resolve to /usr/bin/snap; keep the /snap/bin entry for --version
        let mut exe = if canonical.ends_with("snap") {
            found.to_path_buf()
        } else {
            canonical
        };

        if exe.extension().is_some_and(|ext| ext == "sh") {
            exe.set_extension("");
        } else if let Some(target) = read_launcher_script(&exe, posix) {
            let target = if target.is_absolute() {
                target
            } else {
                found.parent().map(|d| d.join(&target)).unwrap_or(target)
            };
            if !target.exists() {
                warn!("Launcher {} points at missing {}, skipping", exe.display(), target.display());
                return None;
            }
            exe = target;
        }
        Some(exe)
    }
}

/// `exec /usr/lib/firefox/firefox "$@"` style stub scripts found in /usr/bin
fn read_launcher_script(path: &Path, posix: &str) -> Option<PathBuf> {
    let bytes = fs::read(path).ok()?;
    if !bytes.starts_with(b"#!") {
        return None;
    }
    let text = String::from_utf8_lossy(&bytes);
    text.lines()
        .filter(|line| line.starts_with("exec") && line.contains(posix))
        .find_map(|line| line.split_whitespace().nth(1))
        .map(PathBuf::from)
}

fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

impl BrowserLocator for LinuxLocator {
    fn locate(&self) -> Vec<BrowserInstall> {
        let mut found = Vec::new();
        for alias in FIREFOX_ALIASES.iter().filter(|a| a.vendor.is_none() || a.short_name() != "Firefox") {
            let posix = alias.posix();
            for dir in self.candidate_dirs(&posix) {
                let candidate = dir.join(&posix);
                if !is_executable_file(&candidate) {
                    continue;
                }
                info!("Found {} at {}, investigating", alias.name, candidate.display());
                let Some(exe) = self.resolve_executable(&candidate, &posix) else {
                    continue;
                };
                let version = self
                    .runner
                    .stdout_of(&exe.to_string_lossy(), &["--version"])
                    .and_then(|out| parse_version_output(&out));
                debug!("{} version: {:?}", exe.display(), version);

                let mut app = BrowserInstall::new(*alias, exe.clone(), version);
                if let Ok(rest) = exe.strip_prefix("/snap/bin") {
                    // e.g. /snap/bin/firefox -> /snap/firefox/current
                    app = app.with_path(Path::new("/snap").join(rest).join("current"));
                }
                found.push(app);
                break;
            }
        }
        found
    }
}

const MAC_BLOCKED_PATHS: [&str; 3] = ["/Volumes/", "/.Trash/", "/Applications (Parallels)/"];

pub struct MacLocator {
    applications: Vec<PathBuf>,
}

impl MacLocator {
    pub fn new() -> Self {
        Self {
            applications: vec![
                PathBuf::from("/Applications"),
                crate::platform::home_dir().join("Applications"),
            ],
        }
    }

    pub fn with_applications(mut self, applications: Vec<PathBuf>) -> Self {
        self.applications = applications;
        self
    }
}

impl Default for MacLocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Value following `<key>name</key>` in an Info.plist
pub fn plist_string(plist: &str, key: &str) -> Option<String> {
    let marker = format!("<key>{}</key>", key);
    let rest = &plist[plist.find(&marker)? + marker.len()..];
    let start = rest.find("<string>")? + "<string>".len();
    let end = rest[start..].find("</string>")?;
    Some(rest[start..start + end].trim().to_string())
}

impl BrowserLocator for MacLocator {
    fn locate(&self) -> Vec<BrowserInstall> {
        let mut found = Vec::new();
        for dir in &self.applications {
            let Ok(entries) = fs::read_dir(dir) else {
                continue;
            };
            for bundle in entries.flatten().map(|e| e.path()) {
                if bundle.extension().map_or(true, |ext| ext != "app") {
                    continue;
                }
                let display = bundle.to_string_lossy().into_owned();
                if MAC_BLOCKED_PATHS.iter().any(|blocked| display.contains(blocked)) {
                    continue;
                }
                let Ok(plist) = fs::read_to_string(bundle.join("Contents/Info.plist")) else {
                    continue;
                };
                let Some(name) = plist_string(&plist, "CFBundleName") else {
                    continue;
                };
                let Some(alias) = FIREFOX_ALIASES.iter().find(|a| a.matches(&name)) else {
                    continue;
                };
                let executable = plist_string(&plist, "CFBundleExecutable").unwrap_or_else(|| alias.posix());
                let version = plist_string(&plist, "CFBundleShortVersionString").and_then(|v| Version::parse(&v));
                let exe = bundle.join("Contents/MacOS").join(executable);
                found.push(BrowserInstall::new(*alias, exe, version).with_path(bundle));
            }
        }
        found
    }
}

pub struct WindowsLocator {
    runner: Arc<dyn CommandRunner>,
}

impl WindowsLocator {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn query(&self, key: &str, value: &str) -> Option<String> {
        let full_key = format!(r"HKLM\{}", key);
        self.runner
            .stdout_of("reg", &["query", &full_key, "/v", value])
            .and_then(|out| parse_reg_value(&out, value))
    }

    /// Firefox records `CurrentVersion` under its product key and the exe under `<key> <version>\bin`
    fn app_info(&self, alias: BrowserAlias, key: &str, suffix: &str) -> Option<BrowserInstall> {
        let current = self.query(&format!("{}{}", key, suffix), "CurrentVersion")?;
        // "115.3.1 (x64 en-US)" -> "115.3.1"
        let mut version = current.split(' ').next().unwrap_or_default().to_string();
        version.push_str(suffix);
        let Some(exe) = self.query(&format!(r"{} {}\bin", key, version), "PathToExe") else {
            warn!("No PathToExe for {} under {}, skipping", alias.name, key);
            return None;
        };
        Some(BrowserInstall::new(alias, PathBuf::from(exe), Version::parse(&version.replace(' ', "-"))))
    }
}

/// Data column of `reg query ... /v <name>` output
pub fn parse_reg_value(output: &str, name: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix(name)?.trim_start();
        let (_kind, data) = rest.split_once(char::is_whitespace)?;
        Some(data.trim().to_string())
    })
}

impl BrowserLocator for WindowsLocator {
    fn locate(&self) -> Vec<BrowserInstall> {
        let mut found: Vec<BrowserInstall> = Vec::new();
        for alias in FIREFOX_ALIASES.iter() {
            let Some(vendor) = alias.vendor else {
                continue;
            };
            for prefix in ["", r"WOW6432Node\"] {
                for suffix in ["", " ESR"] {
                    let key = format!(r"Software\{}{}\{}", prefix, vendor, alias.name);
                    if let Some(app) = self.app_info(*alias, &key, suffix) {
                        if !found.iter().any(|f| f.path == app.path) {
                            found.push(app);
                        }
                    }
                }
            }
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::fake::FakeRunner;
    use crate::shell::CommandOutput;
    use tempfile::TempDir;

    #[test]
    fn test_parse_version_output() {
        assert_eq!(
            parse_version_output("Mozilla Firefox 128.0.3\n"),
            Some(Version::new(128, 0, 3))
        );
        let esr = parse_version_output("Mozilla Firefox 115.3.1esr").unwrap();
        assert_eq!(esr.build.as_deref(), Some("esr"));
        assert_eq!(parse_version_output(""), None);
    }

    #[test]
    fn test_parse_reg_value() {
        let out = "\r\nHKEY_LOCAL_MACHINE\\Software\\Mozilla\\Mozilla Firefox\r\n    CurrentVersion    REG_SZ    115.3.1 (x64 en-US)\r\n";
        assert_eq!(parse_reg_value(out, "CurrentVersion").as_deref(), Some("115.3.1 (x64 en-US)"));
        assert_eq!(parse_reg_value(out, "PathToExe"), None);
    }

    #[test]
    fn test_windows_registry_lookup() {
        let runner = Arc::new(FakeRunner::new(|_, args| {
            match (args[1], args[3]) {
                (r"HKLM\Software\Mozilla\Mozilla Firefox", "CurrentVersion") => {
                    CommandOutput::ok("    CurrentVersion    REG_SZ    115.3.1 (x64 en-US)\r\n")
                }
                (r"HKLM\Software\Mozilla\Mozilla Firefox 115.3.1\bin", "PathToExe") => CommandOutput::ok(
                    "    PathToExe    REG_SZ    C:\\Program Files\\Mozilla Firefox\\firefox.exe\r\n",
                ),
                _ => CommandOutput::failed("ERROR: The system was unable to find the specified registry key or value."),
            }
        }));
        let found = WindowsLocator::new(runner).locate();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version, Some(Version::new(115, 3, 1)));
        assert_eq!(
            found[0].exe_path,
            PathBuf::from(r"C:\Program Files\Mozilla Firefox\firefox.exe")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_linux_search_path_and_launcher_script() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let bin = dir.path().join("bin");
        let lib = dir.path().join("lib/firefox");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&lib).unwrap();
        let real = lib.join("firefox");
        fs::write(&real, b"\x7fELF").unwrap();
        let stub = bin.join("firefox");
        fs::write(&stub, format!("#!/bin/sh\nexec {} \"$@\"\n", real.display())).unwrap();
        for file in [&real, &stub] {
            fs::set_permissions(file, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let runner = Arc::new(FakeRunner::new(|_, _| CommandOutput::ok("Mozilla Firefox 128.0\n")));
        let found = LinuxLocator::new(runner.clone())
            .with_search_path(vec![bin])
            .locate();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].exe_path, real);
        assert_eq!(found[0].path, lib);
        assert_eq!(found[0].version, Some(Version::new(128, 0, 0)));
        assert_eq!(runner.calls(), vec![format!("{} --version", real.display())]);
    }

    #[test]
    fn test_mac_bundle_scan() {
        let dir = TempDir::new().unwrap();
        let bundle = dir.path().join("Firefox.app");
        fs::create_dir_all(bundle.join("Contents")).unwrap();
        fs::write(
            bundle.join("Contents/Info.plist"),
            "<plist><dict>\n<key>CFBundleExecutable</key>\n<string>firefox</string>\n<key>CFBundleName</key>\n<string>Firefox</string>\n<key>CFBundleShortVersionString</key>\n<string>62.0.2</string>\n</dict></plist>",
        )
        .unwrap();
        fs::create_dir_all(dir.path().join("Notes.app/Contents")).unwrap();

        let found = MacLocator::new()
            .with_applications(vec![dir.path().to_path_buf()])
            .locate();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, bundle);
        assert_eq!(found[0].exe_path, bundle.join("Contents/MacOS/firefox"));
        assert!(!found[0].honors_policy(Platform::MacOs));
    }
}
