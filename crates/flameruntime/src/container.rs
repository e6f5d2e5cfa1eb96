//! The archive file: a hierarchical, self-describing binary container.
//!
//! Layout: an 8-byte magic, a little-endian u64 payload length, and a JSON
//! document holding root attributes, one group per node, and one dataset per
//! retained output with its timestamp sidecar. Datasets carry typed element
//! arrays where the rows are homogeneous numbers; anything else is
//! downgraded to the textual JSON serialization of each row.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;

pub const MAGIC: &[u8; 8] = b"FLAMEH5\x01";

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Archive container IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive container encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("Not an archive container (bad magic)")]
    BadMagic,
}

/// Element payload of one dataset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "dtype", content = "values", rename_all = "snake_case")]
pub enum DatasetData {
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Text(Vec<String>),
}

impl DatasetData {
    pub fn len(&self) -> usize {
        match self {
            DatasetData::Int64(v) => v.len(),
            DatasetData::Float64(v) => v.len(),
            DatasetData::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build a dataset from harvested JSON rows, downgrading heterogeneous
    /// or structured rows to their textual form.
    pub fn from_json_rows(rows: &[serde_json::Value]) -> Self {
        if !rows.is_empty() && rows.iter().all(|v| v.is_i64()) {
            return DatasetData::Int64(rows.iter().filter_map(|v| v.as_i64()).collect());
        }
        if !rows.is_empty() && rows.iter().all(|v| v.is_number()) {
            return DatasetData::Float64(rows.iter().filter_map(|v| v.as_f64()).collect());
        }
        DatasetData::Text(rows.iter().map(|v| v.to_string()).collect())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dataset {
    pub data: DatasetData,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ArchiveGroup {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,
}

impl ArchiveGroup {
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_dataset(
        &mut self,
        name: impl Into<String>,
        data: DatasetData,
        attributes: BTreeMap<String, String>,
    ) {
        self.datasets.insert(name.into(), Dataset { data, attributes });
    }
}

/// The whole archive document, written once at the end of a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ArchiveDocument {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub groups: BTreeMap<String, ArchiveGroup>,
}

impl ArchiveDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn group(&mut self, name: impl Into<String>) -> &mut ArchiveGroup {
        self.groups.entry(name.into()).or_default()
    }

    pub fn write(&self, path: &Path) -> Result<(), ContainerError> {
        let payload = serde_json::to_vec(self)?;
        let mut file = std::fs::File::create(path)?;
        file.write_all(MAGIC)?;
        file.write_all(&(payload.len() as u64).to_le_bytes())?;
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, ContainerError> {
        let mut file = std::fs::File::open(path)?;
        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(ContainerError::BadMagic);
        }
        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        file.read_exact(&mut payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dataset_typing() {
        assert_eq!(
            DatasetData::from_json_rows(&[json!(1), json!(2)]),
            DatasetData::Int64(vec![1, 2])
        );
        assert_eq!(
            DatasetData::from_json_rows(&[json!(1), json!(2.5)]),
            DatasetData::Float64(vec![1.0, 2.5])
        );
        // structured rows are downgraded to text
        assert_eq!(
            DatasetData::from_json_rows(&[json!({"a": 1}), json!(2)]),
            DatasetData::Text(vec!["{\"a\":1}".to_string(), "2".to_string()])
        );
        assert_eq!(DatasetData::from_json_rows(&[]), DatasetData::Text(vec![]));
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.hdf5");

        let mut doc = ArchiveDocument::new();
        doc.set_attr("project", "demo");
        doc.set_attr("job_eui", "#/j1");
        let group = doc.group("b");
        group.set_attr("type", "Doubler");
        let mut attrs = BTreeMap::new();
        attrs.insert("units".to_string(), "a.u.".to_string());
        group.add_dataset("y", DatasetData::Int64(vec![84]), attrs);
        group.add_dataset(
            "y_time",
            DatasetData::Text(vec!["2026-01-01T00:00:00.000Z".to_string()]),
            BTreeMap::new(),
        );
        doc.write(&path).unwrap();

        let back = ArchiveDocument::read(&path).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.groups["b"].datasets["y"].data, DatasetData::Int64(vec![84]));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-an-archive");
        std::fs::write(&path, b"something else entirely").unwrap();
        assert!(matches!(
            ArchiveDocument::read(&path),
            Err(ContainerError::BadMagic)
        ));
    }
}
