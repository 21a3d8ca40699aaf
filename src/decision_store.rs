//! Persistent allow and block lists.
//!
//! One append-only text file per list, one [`IdentityCertificate::data_record`]
//! per line. Lookups match on the first tab separated field, the fingerprint.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::identity::IdentityCertificate;

pub const ALLOW_FILE_NAME: &str = "allowed.dat";
pub const BLOCK_FILE_NAME: &str = "blocked.dat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionList {
    Allow,
    Block,
}

impl DecisionList {
    fn file_name(self) -> &'static str {
        match self {
            DecisionList::Allow => ALLOW_FILE_NAME,
            DecisionList::Block => BLOCK_FILE_NAME,
        }
    }
}

#[derive(Debug)]
pub struct DecisionStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl DecisionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self, list: DecisionList) -> PathBuf {
        self.dir.join(list.file_name())
    }

    pub fn is_allowed(&self, identity: &IdentityCertificate) -> bool {
        self.contains(DecisionList::Allow, identity.fingerprint())
    }

    pub fn is_blocked(&self, identity: &IdentityCertificate) -> bool {
        self.contains(DecisionList::Block, identity.fingerprint())
    }

    /// Unreadable lists count as empty
    pub fn contains(&self, list: DecisionList, fingerprint: &str) -> bool {
        match self.read_lines(list) {
            Ok(lines) => lines
                .iter()
                .any(|line| line.split('\t').next() == Some(fingerprint)),
            Err(e) => {
                warn!("Could not read {}: {:#}", self.path(list).display(), e);
                false
            }
        }
    }

    /// Append `identity` unless it is already listed
    pub fn remember(&self, list: DecisionList, identity: &IdentityCertificate) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.contains(list, identity.fingerprint()) {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).context(format!("Failed to create {}", self.dir.display()))?;
        let path = self.path(list);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!("Failed to open {}", path.display()))?;
        writeln!(file, "{}", identity.data_record()).context(format!("Failed to write {}", path.display()))?;
        info!("Added {} to {}", identity, path.display());
        Ok(())
    }

    /// Drop every line for `fingerprint`; returns whether anything was removed
    pub fn forget(&self, list: DecisionList, fingerprint: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let lines = self.read_lines(list)?;
        let kept: Vec<&String> = lines
            .iter()
            .filter(|line| line.split('\t').next() != Some(fingerprint))
            .collect();
        if kept.len() == lines.len() {
            return Ok(false);
        }
        let path = self.path(list);
        let mut text = String::new();
        for line in kept {
            text.push_str(line);
            text.push('\n');
        }
        fs::write(&path, text).context(format!("Failed to rewrite {}", path.display()))?;
        Ok(true)
    }

    pub fn entries(&self, list: DecisionList) -> Result<Vec<IdentityCertificate>> {
        Ok(self
            .read_lines(list)?
            .iter()
            .filter_map(|line| IdentityCertificate::from_data_record(line))
            .collect())
    }

    fn read_lines(&self, list: DecisionList) -> Result<Vec<String>> {
        read_lines(&self.path(list))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(text
            .lines()
            .map(str::trim_end)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).context(format!("Failed to read {}", path.display())),
    }
}
