//! JSON record store with atomic single-record writes.
//!
//! One record per file under a base directory. Writes go through a temp file
//! and rename, so a crash mid-write can leave the previous version but never
//! a corrupt record. Used for both project snapshots and job records;
//! instances are constructed explicitly and passed in, never looked up from
//! ambient globals.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tracing::debug;

/// Directory-backed store of JSON records keyed by opaque id.
#[derive(Debug, Clone)]
pub struct JsonStore {
    base_dir: PathBuf,
}

impl JsonStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, id: &str) -> Result<PathBuf> {
        if id.is_empty()
            || id.contains('/')
            || id.contains('\\')
            || id.contains("..")
        {
            return Err(anyhow!("invalid record id '{id}'"));
        }
        Ok(self.base_dir.join(format!("{id}.json")))
    }

    /// Atomically write a record (temp file + rename).
    pub fn save_raw(&self, id: &str, data: &Value) -> Result<()> {
        let path = self.record_path(id)?;
        fs::create_dir_all(&self.base_dir)
            .with_context(|| format!("create store directory {}", self.base_dir.display()))?;
        let mut payload = serde_json::to_string_pretty(data).context("serialize record")?;
        payload.push('\n');
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload)
            .with_context(|| format!("write temp record {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &path)
            .with_context(|| format!("replace record {}", path.display()))?;
        debug!(id, path = %path.display(), "record saved");
        Ok(())
    }

    /// Load a record, or `None` when no record with that id exists.
    pub fn load_raw(&self, id: &str) -> Result<Option<Value>> {
        let path = self.record_path(id)?;
        if !path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("read record {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("parse record {}", path.display()))?;
        Ok(Some(value))
    }

    /// All record ids in the store, sorted.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        if !self.base_dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.base_dir)
            .with_context(|| format!("list store directory {}", self.base_dir.display()))?;
        for entry in entries {
            let entry = entry.context("read store directory entry")?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name.strip_suffix(".json") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(temp.path().join("records"));

        let record = json!({"status": "running", "events": [1, 2, 3]});
        store.save_raw("job-1", &record).expect("save");
        let loaded = store.load_raw("job-1").expect("load").expect("present");
        assert_eq!(loaded, record);
    }

    #[test]
    fn load_missing_returns_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(temp.path());
        assert!(store.load_raw("nope").expect("load").is_none());
    }

    #[test]
    fn list_ids_returns_sorted_stems() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(temp.path());
        store.save_raw("b", &json!(1)).expect("save");
        store.save_raw("a", &json!(2)).expect("save");
        assert_eq!(store.list_ids().expect("list"), vec!["a", "b"]);
    }

    #[test]
    fn rejects_path_traversal_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(temp.path());
        assert!(store.save_raw("../escape", &json!(1)).is_err());
        assert!(store.save_raw("a/b", &json!(1)).is_err());
        assert!(store.save_raw("", &json!(1)).is_err());
    }

    #[test]
    fn overwrite_replaces_previous_version() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(temp.path());
        store.save_raw("p", &json!({"v": 1})).expect("save");
        store.save_raw("p", &json!({"v": 2})).expect("save");
        let loaded = store.load_raw("p").expect("load").expect("present");
        assert_eq!(loaded, json!({"v": 2}));
    }
}
