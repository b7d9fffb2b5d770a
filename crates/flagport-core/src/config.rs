//! Migration configuration

use crate::error::MigrationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default API host for both sides
pub const DEFAULT_DOMAIN: &str = "app.launchdarkly.com";

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Project key in the source account
    pub source_project: String,
    /// Project key in the destination account
    pub destination_project: String,
    /// Source API host
    pub source_domain: String,
    /// Destination API host
    pub destination_domain: String,
    /// Directory holding the extracted source data
    pub source_root: PathBuf,
    /// Carry flag maintainers over through `maintainer_mapping`
    pub map_maintainers: bool,
    /// Source member id → destination member id
    pub maintainer_mapping: BTreeMap<String, String>,
    /// Migrate segments before flags
    pub migrate_segments: bool,
    /// Prefix applied to keys and names that collide in the destination
    pub conflict_prefix: Option<String>,
    /// View every migrated flag is linked to
    pub target_view: Option<String>,
    /// Source environments to migrate; empty means all
    pub environment_allowlist: Vec<String>,
    /// Source environment key → destination environment key
    pub environment_mapping: BTreeMap<String, String>,
    /// Look up everything, write nothing
    pub dry_run: bool,
    /// Flags migrated concurrently
    pub concurrency: usize,
    /// Treat a declined approval request as still blocking
    pub block_on_declined_approvals: bool,
    /// Patch retries on 404 right after creation
    pub not_found_retries: u32,
    /// Delay between those retries, in milliseconds
    pub not_found_retry_delay_ms: u64,
}

impl MigrationConfig {
    /// Configuration migrating `source_project` to `destination_project`
    #[must_use]
    pub fn new(source_project: impl Into<String>, destination_project: impl Into<String>) -> Self {
        Self {
            source_project: source_project.into(),
            destination_project: destination_project.into(),
            ..Self::default()
        }
    }

    /// Parse YAML configuration
    ///
    /// # Errors
    /// `MigrationError::Config` when the document does not parse
    pub fn from_yaml(raw: &str) -> Result<Self, MigrationError> {
        serde_yaml::from_str(raw).map_err(|e| MigrationError::Config(e.to_string()))
    }

    /// Load YAML configuration from a file
    ///
    /// # Errors
    /// `MigrationError::Config` when the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| MigrationError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    /// With conflict prefix
    #[inline]
    #[must_use]
    pub fn with_conflict_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.conflict_prefix = Some(prefix.into());
        self
    }

    /// With target view
    #[inline]
    #[must_use]
    pub fn with_target_view(mut self, view: impl Into<String>) -> Self {
        self.target_view = Some(view.into());
        self
    }

    /// With source host
    #[inline]
    #[must_use]
    pub fn with_source_domain(mut self, domain: impl Into<String>) -> Self {
        self.source_domain = domain.into();
        self
    }

    /// With destination host
    #[inline]
    #[must_use]
    pub fn with_destination_domain(mut self, domain: impl Into<String>) -> Self {
        self.destination_domain = domain.into();
        self
    }

    /// With source data directory
    #[inline]
    #[must_use]
    pub fn with_source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = root.into();
        self
    }

    /// With maintainer mapping; enables maintainer migration
    #[must_use]
    pub fn with_maintainer_mapping(mut self, mapping: BTreeMap<String, String>) -> Self {
        self.map_maintainers = true;
        self.maintainer_mapping = mapping;
        self
    }

    /// With environment allowlist
    #[must_use]
    pub fn with_environments<I, S>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.environment_allowlist = envs.into_iter().map(Into::into).collect();
        self
    }

    /// With one environment rename
    #[must_use]
    pub fn with_environment_rename(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.environment_mapping.insert(from.into(), to.into());
        self
    }

    /// With segment migration switched on or off
    #[inline]
    #[must_use]
    pub fn with_segments(mut self, migrate: bool) -> Self {
        self.migrate_segments = migrate;
        self
    }

    /// With dry run
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With worker count
    #[inline]
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// With declined approvals blocking
    #[inline]
    #[must_use]
    pub fn with_block_on_declined(mut self, block: bool) -> Self {
        self.block_on_declined_approvals = block;
        self
    }

    /// With 404 retry policy
    #[inline]
    #[must_use]
    pub fn with_not_found_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.not_found_retries = retries;
        self.not_found_retry_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Delay between 404 retries
    #[inline]
    #[must_use]
    pub fn not_found_retry_delay(&self) -> Duration {
        Duration::from_millis(self.not_found_retry_delay_ms)
    }

    /// Check required fields
    ///
    /// # Errors
    /// `MigrationError::Config` naming the first problem found
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.source_project.trim().is_empty() {
            return Err(MigrationError::Config("source_project is required".to_string()));
        }
        if self.destination_project.trim().is_empty() {
            return Err(MigrationError::Config(
                "destination_project is required".to_string(),
            ));
        }
        if self.source_domain.trim().is_empty() {
            return Err(MigrationError::Config(
                "source_domain must not be empty".to_string(),
            ));
        }
        if self.destination_domain.trim().is_empty() {
            return Err(MigrationError::Config(
                "destination_domain must not be empty".to_string(),
            ));
        }
        if self.concurrency == 0 {
            return Err(MigrationError::Config(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if let Some(target) = self
            .environment_mapping
            .values()
            .find(|target| target.trim().is_empty())
        {
            return Err(MigrationError::Config(format!(
                "environment_mapping has an empty target '{target}'"
            )));
        }
        Ok(())
    }

    /// Whether a source environment is migrated
    #[must_use]
    pub fn includes_environment(&self, source_env: &str) -> bool {
        self.environment_allowlist.is_empty()
            || self.environment_allowlist.iter().any(|e| e == source_env)
    }

    /// Destination key of a source environment
    #[must_use]
    pub fn dest_environment_key<'a>(&'a self, source_env: &'a str) -> &'a str {
        self.environment_mapping
            .get(source_env)
            .map_or(source_env, String::as_str)
    }

    /// Destination member for a source maintainer, when mapping is enabled
    #[must_use]
    pub fn mapped_maintainer(&self, source_member: &str) -> Option<&str> {
        if !self.map_maintainers {
            return None;
        }
        self.maintainer_mapping.get(source_member).map(String::as_str)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            source_project: String::new(),
            destination_project: String::new(),
            source_domain: DEFAULT_DOMAIN.to_string(),
            destination_domain: DEFAULT_DOMAIN.to_string(),
            source_root: PathBuf::from("source"),
            map_maintainers: false,
            maintainer_mapping: BTreeMap::new(),
            migrate_segments: true,
            conflict_prefix: None,
            target_view: None,
            environment_allowlist: Vec::new(),
            environment_mapping: BTreeMap::new(),
            dry_run: false,
            concurrency: 1,
            block_on_declined_approvals: false,
            not_found_retries: 2,
            not_found_retry_delay_ms: 2000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_defaults() {
        let config = MigrationConfig::from_yaml(
            "source_project: legacy\n\
             destination_project: platform\n\
             conflict_prefix: imported-\n\
             environment_mapping:\n  production: prod\n",
        )
        .unwrap();

        assert_eq!(config.source_domain, DEFAULT_DOMAIN);
        assert_eq!(config.destination_domain, DEFAULT_DOMAIN);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.not_found_retries, 2);
        assert_eq!(config.not_found_retry_delay(), Duration::from_secs(2));
        assert!(config.migrate_segments);
        assert!(!config.block_on_declined_approvals);
        assert_eq!(config.conflict_prefix.as_deref(), Some("imported-"));
        assert_eq!(config.dest_environment_key("production"), "prod");
        assert_eq!(config.dest_environment_key("test"), "test");
        config.validate().unwrap();
    }

    #[test]
    fn unknown_yaml_is_a_config_error() {
        let err = MigrationConfig::from_yaml("concurrency: many").unwrap_err();
        assert!(matches!(err, MigrationError::Config(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn validation_rejects_missing_projects_and_zero_workers() {
        assert!(MigrationConfig::default().validate().is_err());
        assert!(MigrationConfig::new("a", "b")
            .with_concurrency(0)
            .validate()
            .is_err());
        assert!(MigrationConfig::new("a", "b")
            .with_environment_rename("production", " ")
            .validate()
            .is_err());
    }

    #[test]
    fn allowlist_and_maintainers() {
        let config = MigrationConfig::new("a", "b").with_environments(["prod"]);
        assert!(config.includes_environment("prod"));
        assert!(!config.includes_environment("test"));
        assert!(MigrationConfig::new("a", "b").includes_environment("anything"));

        let mapping = BTreeMap::from([("src-1".to_string(), "dst-1".to_string())]);
        let config = MigrationConfig::new("a", "b").with_maintainer_mapping(mapping.clone());
        assert_eq!(config.mapped_maintainer("src-1"), Some("dst-1"));
        assert_eq!(config.mapped_maintainer("src-2"), None);

        let mut disabled = config;
        disabled.map_maintainers = false;
        assert_eq!(disabled.mapped_maintainer("src-1"), None);
    }
}
