//! Extracted source data
//!
//! The engine never talks to the source project's API. It reads documents
//! that an extraction step already saved, through [`SourceStore`].

use crate::error::SourceError;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Read access to an extracted source project
pub trait SourceStore: Send + Sync {
    /// Project document
    ///
    /// # Errors
    /// `SourceError` when the document is missing or unreadable
    fn project(&self) -> Result<Value, SourceError>;

    /// Environment documents, in source order
    ///
    /// # Errors
    /// `SourceError` when the document is missing or unreadable
    fn environments(&self) -> Result<Vec<Value>, SourceError>;

    /// Keys of every flag to migrate, in source order
    ///
    /// # Errors
    /// `SourceError` when the document is missing or unreadable
    fn flag_keys(&self) -> Result<Vec<String>, SourceError>;

    /// Full flag document, including per-environment configuration
    ///
    /// # Errors
    /// `SourceError` when the document is missing or unreadable
    fn flag(&self, key: &str) -> Result<Value, SourceError>;

    /// Segments of one environment; none is not an error
    ///
    /// # Errors
    /// `SourceError` when a present document is unreadable
    fn segments(&self, env: &str) -> Result<Vec<Value>, SourceError>;
}

/// Source store over the extraction directory layout:
///
/// ```text
/// {root}/{project}/project.json
/// {root}/{project}/environments.json
/// {root}/{project}/flags.json
/// {root}/{project}/flags/{flag}.json
/// {root}/{project}/segments/{env}.json
/// ```
#[derive(Debug, Clone)]
pub struct FsSourceStore {
    dir: PathBuf,
}

impl FsSourceStore {
    /// Store for `project_key` under `root`
    #[must_use]
    pub fn new(root: impl AsRef<Path>, project_key: &str) -> Self {
        Self {
            dir: root.as_ref().join(project_key),
        }
    }

    /// Project directory
    #[inline]
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, relative: impl AsRef<Path>) -> Result<Value, SourceError> {
        let path = self.dir.join(relative);
        let raw = std::fs::read_to_string(&path).map_err(|source| SourceError::Io {
            path: path.clone(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SourceError::Json { path, source })
    }
}

impl SourceStore for FsSourceStore {
    fn project(&self) -> Result<Value, SourceError> {
        self.read("project.json")
    }

    fn environments(&self) -> Result<Vec<Value>, SourceError> {
        items("environments.json", self.read("environments.json")?)
    }

    fn flag_keys(&self) -> Result<Vec<String>, SourceError> {
        items("flags.json", self.read("flags.json")?)?
            .into_iter()
            .map(|entry| match entry {
                Value::String(key) => Ok(key),
                other => other
                    .get("key")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| SourceError::Malformed {
                        what: "flags.json".to_string(),
                        reason: "entry without a key".to_string(),
                    }),
            })
            .collect()
    }

    fn flag(&self, key: &str) -> Result<Value, SourceError> {
        self.read(Path::new("flags").join(format!("{key}.json")))
    }

    fn segments(&self, env: &str) -> Result<Vec<Value>, SourceError> {
        let relative = Path::new("segments").join(format!("{env}.json"));
        if !self.dir.join(&relative).exists() {
            return Ok(Vec::new());
        }
        items("segments", self.read(relative)?)
    }
}

/// Accept a bare array or an `{"items": [...]}` envelope
fn items(what: &str, document: Value) -> Result<Vec<Value>, SourceError> {
    match document {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(SourceError::Malformed {
                what: what.to_string(),
                reason: "expected an array or an object with `items`".to_string(),
            }),
        },
        _ => Err(SourceError::Malformed {
            what: what.to_string(),
            reason: "expected an array or an object with `items`".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_and_bare_arrays() {
        assert_eq!(items("x", json!([1, 2])).unwrap().len(), 2);
        assert_eq!(items("x", json!({"items": [1]})).unwrap().len(), 1);
        assert!(matches!(
            items("x", json!({"data": []})),
            Err(SourceError::Malformed { .. })
        ));
    }
}
