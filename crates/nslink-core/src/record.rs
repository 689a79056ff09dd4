//! Run Record Store: the on-disk description of an in-flight run.
//!
//! One TOML file per run, `run-<pid>.toml`, under the state directory.
//! The file existing is the signal that a run's namespaces may still
//! hold interfaces and need reconciling.

use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::pid_alive;

pub const RECORD_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub version: u32,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
    pub src_domain: String,
    pub dst_domain: String,
    pub src_if: String,
    pub dst_if: String,
    pub src_addr: String,
    pub dst_addr: String,
    pub mtu: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl RunRecord {
    pub fn involves(&self, iface: &str) -> bool {
        self.src_if == iface || self.dst_if == iface
    }

    pub fn is_stale(&self) -> bool {
        !pid_alive(self.pid)
    }

    /// `(domain, interface)` for both ends, source first.
    pub fn ends(&self) -> [(&str, &str); 2] {
        [
            (self.src_domain.as_str(), self.src_if.as_str()),
            (self.dst_domain.as_str(), self.dst_if.as_str()),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, pid: u32) -> PathBuf {
        self.dir.join(format!("run-{pid}.toml"))
    }

    /// Write atomically: a crash never leaves a half-written record.
    pub fn save(&self, record: &RunRecord) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create state dir {}", self.dir.display()))?;
        let path = self.path_for(record.pid);
        let tmp = path.with_extension("toml.tmp");
        let body = toml::to_string(record).context("serialize run record")?;
        fs::write(&tmp, body).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
        debug!(path = %path.display(), "run record saved");
        Ok(path)
    }

    pub fn load(&self, pid: u32) -> Result<Option<RunRecord>> {
        let path = self.path_for(pid);
        match fs::read_to_string(&path) {
            Ok(text) => parse(&path, &text).map(Some),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    /// All readable records, oldest first. Corrupt files are skipped.
    pub fn list(&self) -> Result<Vec<RunRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("list {}", self.dir.display())),
        };
        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run-") && n.ends_with(".toml"));
            if !is_record {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| parse(&path, &text))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }
        records.sort_by_key(|r| (r.created_at, r.pid));
        Ok(records)
    }

    /// Records whose owning process is gone.
    pub fn stale(&self) -> Result<Vec<RunRecord>> {
        Ok(self.list()?.into_iter().filter(RunRecord::is_stale).collect())
    }

    /// Idempotent: a missing record is not an error.
    pub fn remove(&self, pid: u32) -> Result<()> {
        let path = self.path_for(pid);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "run record removed");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }
}

fn parse(path: &Path, text: &str) -> Result<RunRecord> {
    toml::from_str(text).with_context(|| format!("parse run record {}", path.display()))
}
