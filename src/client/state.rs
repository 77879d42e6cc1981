//! Local resume state.
//!
//! A small JSON document holding the upload location and the idempotency
//! key used to create it.  It is rewritten atomically (temp file in the
//! same directory, then rename) so a crash mid-write leaves either the old
//! or the new record, never a torn one.
//!
//! Files holding nothing but a bare location URL are also accepted.

use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    /// Last known upload location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Token sent with the creation request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl ResumeState {
    /// Load the state at `path`.  A missing or empty file is an empty state.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        let trimmed = contents.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        if !trimmed.starts_with('{') {
            return Ok(Self {
                location: Some(trimmed.to_string()),
                idempotency_key: None,
            });
        }
        serde_json::from_str(trimmed).with_context(|| format!("parsing {}", path.display()))
    }

    /// Atomically replace the state at `path` with `self`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    /// Remove the state file.  Removing a missing file is not an error.
    pub fn clear(path: &Path) -> anyhow::Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }
}
