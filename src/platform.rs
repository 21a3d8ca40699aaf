//! Host platform detection and per-platform data directories.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Windows,
}

impl Platform {
    /// Detected once at startup and passed down explicitly from there
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOs,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    /// Machine wide data directory shared by every user
    pub fn shared_dir(self, app: &str) -> PathBuf {
        match self {
            Platform::Linux => PathBuf::from("/srv").join(app),
            Platform::MacOs => PathBuf::from("/Library/Application Support").join(app),
            Platform::Windows => std::env::var_os("PROGRAMDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"))
                .join(app),
        }
    }

    /// Per-user data directory
    pub fn user_dir(self, app: &str) -> PathBuf {
        let home = home_dir();
        match self {
            Platform::Linux => home.join(format!(".{}", app)),
            Platform::MacOs => home.join("Library/Application Support").join(app),
            Platform::Windows => std::env::var_os("APPDATA")
                .map(PathBuf::from)
                .unwrap_or_else(|| home.join("AppData").join("Roaming"))
                .join(app),
        }
    }
}

pub fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}
