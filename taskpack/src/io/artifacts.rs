//! Canonical artifact persistence.
//!
//! Every record the kernel and the worktree engine produce is written through
//! [`ArtifactWriter`]: canonical bytes, SHA-256 content hash, temp file in the
//! same directory, then rename. An observer never sees a half-written file;
//! a set of several files is not written atomically as a whole.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::canonical::{sha256_hex, to_canonical_string};

/// Index file listing every artifact written by one invocation.
pub const ARTIFACT_INDEX: &str = "ARTIFACT_INDEX.json";

/// Hash and size of one written artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIndex {
    pub schema_version: u32,
    pub artifacts: BTreeMap<String, ArtifactEntry>,
}

/// Append-only writer scoped to one run directory.
#[derive(Debug)]
pub struct ArtifactWriter {
    dir: PathBuf,
    written: BTreeMap<String, ArtifactEntry>,
}

impl ArtifactWriter {
    /// Create the directory if needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        Ok(Self {
            dir,
            written: BTreeMap::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Write a structured value as canonical JSON; returns the content hash.
    pub fn write_json<T: Serialize>(&mut self, name: &str, value: &T) -> Result<String> {
        let text = to_canonical_string(value).with_context(|| format!("serialize {name}"))?;
        self.write_bytes(name, text.as_bytes())
    }

    /// Write text verbatim; returns the content hash.
    pub fn write_text(&mut self, name: &str, text: &str) -> Result<String> {
        self.write_bytes(name, text.as_bytes())
    }

    /// Hashes of everything written so far, by name.
    pub fn index(&self) -> &BTreeMap<String, ArtifactEntry> {
        &self.written
    }

    pub fn contains(&self, name: &str) -> bool {
        self.written.contains_key(name)
    }

    /// Write `ARTIFACT_INDEX.json` covering every artifact written so far.
    /// The index does not list itself.
    pub fn write_index(&mut self) -> Result<String> {
        let index = ArtifactIndex {
            schema_version: 1,
            artifacts: self.written.clone(),
        };
        let text = to_canonical_string(&index).context("serialize artifact index")?;
        let path = self.dir.join(ARTIFACT_INDEX);
        write_atomic(&path, text.as_bytes())?;
        Ok(sha256_hex(text.as_bytes()))
    }

    fn write_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<String> {
        if name.contains('/') || name.contains('\\') || name.starts_with('.') {
            bail!("artifact name '{name}' must be a plain file name");
        }
        if self.written.contains_key(name) {
            bail!("artifact {name} already written in this run");
        }
        let path = self.dir.join(name);
        write_atomic(&path, bytes)?;
        let sha256 = sha256_hex(bytes);
        debug!(artifact = name, sha256 = %sha256, "artifact written");
        self.written.insert(
            name.to_string(),
            ArtifactEntry {
                sha256: sha256.clone(),
                bytes: bytes.len() as u64,
            },
        );
        Ok(sha256)
    }
}

/// Write `bytes` to a sibling temp file, sync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("artifact path missing file name {}", path.display()))?;
    let tmp_path = parent.join(format!(".{}.tmp", file_name.to_string_lossy()));
    {
        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create temp file {}", tmp_path.display()))?;
        file.write_all(bytes)
            .with_context(|| format!("write temp file {}", tmp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync temp file {}", tmp_path.display()))?;
    }
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Read a JSON record from a run directory, `None` when the file is absent.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn identical_values_produce_identical_bytes_and_hashes() {
        let a = tempfile::tempdir().expect("tempdir a");
        let b = tempfile::tempdir().expect("tempdir b");
        let mut wa = ArtifactWriter::create(a.path()).expect("writer a");
        let mut wb = ArtifactWriter::create(b.path()).expect("writer b");
        let value = json!({"z": 1, "a": {"c": [3, 2], "b": "x"}});
        let ha = wa.write_json("PLAN.json", &value).expect("write a");
        let hb = wb.write_json("PLAN.json", &value).expect("write b");
        assert_eq!(ha, hb);
        assert_eq!(
            fs::read(a.path().join("PLAN.json")).expect("read a"),
            fs::read(b.path().join("PLAN.json")).expect("read b")
        );
    }

    #[test]
    fn names_cannot_be_written_twice() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut writer = ArtifactWriter::create(temp.path()).expect("writer");
        writer.write_text("A.md", "one").expect("first");
        let err = writer.write_text("A.md", "two").expect_err("second");
        assert!(err.to_string().contains("already written"));
        assert_eq!(fs::read_to_string(temp.path().join("A.md")).expect("read"), "one");
    }

    #[test]
    fn index_lists_every_artifact_with_hash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut writer = ArtifactWriter::create(temp.path()).expect("writer");
        let hash = writer.write_text("A.md", "abc").expect("write");
        writer.write_index().expect("index");
        let index: ArtifactIndex = read_json(&temp.path().join(ARTIFACT_INDEX))
            .expect("read")
            .expect("present");
        assert_eq!(index.artifacts["A.md"].sha256, hash);
        assert_eq!(index.artifacts["A.md"].bytes, 3);
        assert!(!index.artifacts.contains_key(ARTIFACT_INDEX));
    }

    #[test]
    fn no_temp_files_remain_after_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut writer = ArtifactWriter::create(temp.path()).expect("writer");
        writer.write_text("A.md", "abc").expect("write");
        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["A.md"]);
    }

    #[test]
    fn path_like_names_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut writer = ArtifactWriter::create(temp.path()).expect("writer");
        assert!(writer.write_text("../escape.md", "x").is_err());
    }
}
