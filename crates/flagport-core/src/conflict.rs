//! Key-collision handling during resource creation
//!
//! A resource gets at most two creation attempts: its own key, then the key
//! with the configured conflict prefix. The resolver counts 409s per resource,
//! decides what the next attempt is, and keeps an append-only log of every
//! rename for the end-of-run report.

use crate::error::ConflictError;
use crate::types::ResourceType;
use flagport_api::ApiResponse;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;

/// One applied rename
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictResolution {
    /// Key in the source project
    pub original_key: String,
    /// Key used in the destination
    pub resolved_key: String,
    /// Resource type
    pub resource_type: ResourceType,
    /// Prefix that was applied
    pub conflict_prefix: String,
    /// Environment for environment-scoped resources (segments)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// What to do after a 409
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictDecision {
    /// Create again under a new key and name
    Retry {
        /// Prefixed key
        key: String,
        /// Prefixed name, when the resource has one
        name: Option<String>,
    },
    /// Stop creating; the resource under `key` is treated as existing and updated
    UseExisting {
        /// Key of the colliding resource
        key: String,
    },
}

type ResourceId = (ResourceType, Option<String>, String);

#[derive(Debug, Default)]
struct Ledger {
    attempts: HashMap<ResourceId, u8>,
    resolutions: Vec<ConflictResolution>,
}

/// Collision tracker shared by every creation path of a run
#[derive(Debug, Default)]
pub struct ConflictResolver {
    prefix: Option<String>,
    ledger: Mutex<Ledger>,
}

impl ConflictResolver {
    /// Create resolver; an empty or blank prefix disables renaming
    #[must_use]
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.trim().is_empty()),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Configured prefix
    #[inline]
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Decide the next step after a 409 for a project-wide resource
    ///
    /// # Errors
    /// `ConflictError::AttemptsExhausted` on a third collision
    pub fn resolve(
        &self,
        resource_type: ResourceType,
        original_key: &str,
        original_name: Option<&str>,
        response: &ApiResponse,
    ) -> Result<ConflictDecision, ConflictError> {
        self.resolve_scoped(resource_type, None, original_key, original_name, response)
    }

    /// Decide the next step after a 409 for a resource living inside `scope`
    /// (the environment of a segment)
    ///
    /// # Errors
    /// `ConflictError::AttemptsExhausted` on a third collision
    pub fn resolve_scoped(
        &self,
        resource_type: ResourceType,
        scope: Option<&str>,
        original_key: &str,
        original_name: Option<&str>,
        response: &ApiResponse,
    ) -> Result<ConflictDecision, ConflictError> {
        let mut ledger = self.ledger.lock();
        let id = (
            resource_type,
            scope.map(str::to_string),
            original_key.to_string(),
        );
        let attempts = ledger.attempts.entry(id).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let attempt = *attempts;

        tracing::info!(
            resource = %resource_type,
            key = original_key,
            attempt,
            detail = %response.message(),
            "key conflict in destination"
        );

        match (attempt, self.prefix.as_deref()) {
            (1, Some(prefix)) => {
                let key = format!("{prefix}{original_key}");
                ledger.resolutions.push(ConflictResolution {
                    original_key: original_key.to_string(),
                    resolved_key: key.clone(),
                    resource_type,
                    conflict_prefix: prefix.to_string(),
                    scope: scope.map(str::to_string),
                });
                Ok(ConflictDecision::Retry {
                    key,
                    name: original_name.map(|name| format!("{prefix}{name}")),
                })
            }
            (1, None) => Ok(ConflictDecision::UseExisting {
                key: original_key.to_string(),
            }),
            (2, prefix) => Ok(ConflictDecision::UseExisting {
                key: prefix.map_or_else(
                    || original_key.to_string(),
                    |p| format!("{p}{original_key}"),
                ),
            }),
            _ => Err(ConflictError::AttemptsExhausted {
                resource_type,
                key: original_key.to_string(),
                attempts: attempt,
            }),
        }
    }

    /// Destination key for a project-wide resource (original if never renamed)
    #[must_use]
    pub fn resolved_key(&self, resource_type: ResourceType, key: &str) -> String {
        self.resolved_key_scoped(resource_type, None, key)
    }

    /// Destination key for a resource inside `scope`
    #[must_use]
    pub fn resolved_key_scoped(
        &self,
        resource_type: ResourceType,
        scope: Option<&str>,
        key: &str,
    ) -> String {
        self.ledger
            .lock()
            .resolutions
            .iter()
            .find(|r| {
                r.resource_type == resource_type
                    && r.original_key == key
                    && r.scope.as_deref() == scope
            })
            .map_or_else(|| key.to_string(), |r| r.resolved_key.clone())
    }

    /// Renames applied so far, in order
    #[must_use]
    pub fn resolutions(&self) -> Vec<ConflictResolution> {
        self.ledger.lock().resolutions.clone()
    }

    /// Number of renames applied
    #[must_use]
    pub fn len(&self) -> usize {
        self.ledger.lock().resolutions.len()
    }

    /// Whether no rename was applied
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deterministic text summary: total, per-type counts, ordered renames
    #[must_use]
    pub fn report(&self) -> String {
        let ledger = self.ledger.lock();
        let mut by_type: BTreeMap<ResourceType, usize> = BTreeMap::new();
        for resolution in &ledger.resolutions {
            *by_type.entry(resolution.resource_type).or_default() += 1;
        }

        let mut out = String::new();
        let _ = writeln!(out, "Conflict resolutions: {}", ledger.resolutions.len());
        if ledger.resolutions.is_empty() {
            return out;
        }
        for (resource_type, count) in &by_type {
            let _ = writeln!(out, "  {resource_type}: {count}");
        }
        out.push_str("Renamed keys:\n");
        for r in &ledger.resolutions {
            let _ = writeln!(
                out,
                "  {}: \"{}\" → \"{}\"",
                r.resource_type, r.original_key, r.resolved_key
            );
        }
        out
    }
}
