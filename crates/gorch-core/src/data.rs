//! Read-only mirror of a node's data directory.
//!
//! Every `*.json` file in the directory is loaded as an object and exposed
//! under its file stem (`metrics.json` → `metrics`).

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{GorchError, Result};

pub type DataObject = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DataStore(BTreeMap<String, DataObject>);

impl DataStore {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let data = std::fs::read_to_string(&path)?;
            let object: DataObject = serde_json::from_str(&data)?;
            files.insert(stem.to_string(), object);
        }
        Ok(Self(files))
    }

    pub fn get(&self, file: &str) -> Result<&DataObject> {
        self.0
            .get(file)
            .ok_or_else(|| GorchError::DataNotFound(file.to_string()))
    }

    pub fn files(&self) -> Vec<&str> {
        self.0.keys().map(String::as_str).collect()
    }

    pub fn keys(&self, file: &str) -> Result<Vec<&str>> {
        Ok(self.get(file)?.keys().map(String::as_str).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_only_json_files() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("metrics.json"), r#"{"cpu":1,"mem":2}"#).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        std::fs::create_dir(dir.path().join("sub.json")).unwrap();

        let store = DataStore::load(dir.path()).unwrap();
        assert_eq!(store.files(), vec!["metrics"]);
        assert_eq!(store.keys("metrics").unwrap(), vec!["cpu", "mem"]);
        assert_eq!(store.get("metrics").unwrap()["cpu"], 1);
    }

    #[test]
    fn unknown_file_is_not_found() {
        let store = DataStore::default();
        assert!(matches!(
            store.get("nope"),
            Err(GorchError::DataNotFound(_))
        ));
    }

    #[test]
    fn malformed_json_fails_the_load() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("bad.json"), "[1,2]").unwrap();
        assert!(matches!(
            DataStore::load(dir.path()),
            Err(GorchError::Json(_))
        ));
    }
}
