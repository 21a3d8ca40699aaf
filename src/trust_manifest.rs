//! Trust manifest: the `localgate.properties` key/value file
//!
//! Records, per role, where the keystore lives, how to open it and which alias
//! to read:
//!
//! ```text
//! ca.keystore=/home/me/.localgate/ssl/root-ca.p12
//! ca.storepass=3f9c0a...
//! ca.alias=root-ca
//! wss.keystore=/home/me/.localgate/ssl/localgate.p12
//! wss.storepass=3f9c0a...
//! wss.alias=localgate
//! wss.host=0.0.0.0
//! ```
//!
//! The file uses Java properties syntax (`#`/`!` comments, `=` or `:`
//! separators, backslash escapes) so manifests written by earlier installs keep
//! loading.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::key_material::Role;

pub const MANIFEST_FILE_NAME: &str = "localgate.properties";

/// Keys an administrator may edit by hand; the on-disk value always wins
pub const USER_SETTABLE_KEYS: &[&str] = &["wss.host"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustManifest {
    entries: BTreeMap<String, String>,
}

impl TrustManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .context(format!("Failed to read manifest {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = BTreeMap::new();
        for line in logical_lines(text) {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
                continue;
            }
            let (key, value) = split_entry(trimmed);
            entries.insert(unescape(&key), unescape(value.trim_start()));
        }
        Self { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn put(&mut self, key: &str, value: &str) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Insert only when the key is not present yet; returns whether it was inserted
    pub fn put_if_absent(&mut self, key: &str, value: &str) -> bool {
        if self.entries.contains_key(key) {
            return false;
        }
        self.put(key, value);
        true
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries.remove(key)
    }

    /// Role scoped lookup, e.g. `role_value(Role::Leaf, "keystore")` reads `wss.keystore`
    pub fn role_value(&self, role: Role, field: &str) -> Option<&str> {
        self.get(&role_key(role, field))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn to_properties_string(&self) -> String {
        let mut out = String::from("#localgate trust manifest\n");
        for (key, value) in &self.entries {
            out.push_str(&escape(key, true));
            out.push('=');
            out.push_str(&escape(value, false));
            out.push('\n');
        }
        out
    }

    /// Write to `path` without dropping what an earlier run put there
    ///
    /// Entries already on disk are merged in with put-if-absent semantics: values
    /// held in memory win, keys only found on disk survive. [`USER_SETTABLE_KEYS`]
    /// are the exception and keep their on-disk value.
    pub fn save_merged(&mut self, path: &Path) -> Result<()> {
        if path.exists() {
            match Self::load(path) {
                Ok(existing) => {
                    for (key, value) in existing.entries {
                        if USER_SETTABLE_KEYS.contains(&key.as_str()) {
                            self.entries.insert(key, value);
                        } else {
                            self.entries.entry(key).or_insert(value);
                        }
                    }
                }
                Err(e) => tracing::warn!("Ignoring unreadable manifest {}: {:#}", path.display(), e),
            }
        }
        fs::write(path, self.to_properties_string())
            .context(format!("Failed to write manifest {}", path.display()))
    }
}

pub fn role_key(role: Role, field: &str) -> String {
    format!("{}.{}", role.props_prefix(), field)
}

/// Join lines ending in an odd number of backslashes with the following line
fn logical_lines(text: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut continuing = false;
    for raw in text.lines() {
        let piece = if continuing { raw.trim_start() } else { raw };
        let trailing = piece.chars().rev().take_while(|c| *c == '\\').count();
        if trailing % 2 == 1 {
            current.push_str(&piece[..piece.len() - 1]);
            continuing = true;
        } else {
            current.push_str(piece);
            lines.push(std::mem::take(&mut current));
            continuing = false;
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Split at the first unescaped `=`, `:` or whitespace
fn split_entry(line: &str) -> (String, &str) {
    let mut key = String::new();
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            key.push('\\');
            key.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (key, &line[idx + 1..]),
            c if c.is_whitespace() => {
                let rest = line[idx..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (key, rest);
            }
            c => key.push(c),
        }
    }
    (key, "")
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('f') => out.push('\u{c}'),
            Some('u') => {
                let code: String = chars.by_ref().take(4).collect();
                match u32::from_str_radix(&code, 16).ok().and_then(char::from_u32) {
                    Some(decoded) => out.push(decoded),
                    None => out.push_str(&code),
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn escape(value: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for (idx, c) in value.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || idx == 0 => out.push_str("\\ "),
            c => out.push(c),
        }
    }
    out
}
