use flagport_core::{SourceError, SourceStore};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Extracted source project held in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    project: Value,
    environments: Vec<Value>,
    flags: Vec<(String, Value)>,
    segments: BTreeMap<String, Vec<Value>>,
}

impl MemorySource {
    pub fn new(project_key: &str) -> Self {
        Self {
            project: json!({"key": project_key, "name": project_key, "tags": ["source"]}),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_environment(mut self, key: &str) -> Self {
        self.environments.push(crate::fixtures::environment(key));
        self
    }

    /// Add a flag document; its `key` is listed in source order
    #[must_use]
    pub fn with_flag(mut self, flag: Value) -> Self {
        let key = flag["key"].as_str().unwrap_or_default().to_string();
        self.flags.push((key, flag));
        self
    }

    #[must_use]
    pub fn with_segment(mut self, env: &str, segment: Value) -> Self {
        self.segments.entry(env.to_string()).or_default().push(segment);
        self
    }
}

impl SourceStore for MemorySource {
    fn project(&self) -> Result<Value, SourceError> {
        Ok(self.project.clone())
    }

    fn environments(&self) -> Result<Vec<Value>, SourceError> {
        Ok(self.environments.clone())
    }

    fn flag_keys(&self) -> Result<Vec<String>, SourceError> {
        Ok(self.flags.iter().map(|(key, _)| key.clone()).collect())
    }

    fn flag(&self, key: &str) -> Result<Value, SourceError> {
        self.flags
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, flag)| flag.clone())
            .ok_or_else(|| SourceError::Malformed {
                what: format!("flags/{key}.json"),
                reason: "not extracted".to_string(),
            })
    }

    fn segments(&self, env: &str) -> Result<Vec<Value>, SourceError> {
        Ok(self.segments.get(env).cloned().unwrap_or_default())
    }
}
