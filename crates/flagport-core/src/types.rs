//! Core types for migrations
//!
//! Defines:
//! - Resource types and patch operations
//! - Destination variations (server-assigned identifiers)
//! - Approval requests and their statuses

use crate::translate::SemanticInstruction;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Kind of migrated entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// Project
    Project,
    /// Environment within a project
    Environment,
    /// View (flag grouping)
    View,
    /// Segment within an environment
    Segment,
    /// Feature flag
    Flag,
}

impl ResourceType {
    /// Lowercase name used in logs and reports
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Project => "project",
            ResourceType::Environment => "environment",
            ResourceType::View => "view",
            ResourceType::Segment => "segment",
            ResourceType::Flag => "flag",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON-patch verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Add (or append with a `/-` path)
    Add,
    /// Replace existing value
    Replace,
    /// Remove value
    Remove,
}

/// Generic field-level patch instruction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOperation {
    /// Verb
    pub op: PatchOp,
    /// JSON pointer, e.g. `/environments/prod/on`
    pub path: String,
    /// New value (absent for `remove`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOperation {
    /// Replace `path` with `value`
    #[inline]
    #[must_use]
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Add `value` at `path`
    #[inline]
    #[must_use]
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Remove `path`
    #[inline]
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: path.into(),
            value: None,
        }
    }

    /// Environment the operation is scoped to, if any
    #[must_use]
    pub fn environment(&self) -> Option<&str> {
        let mut parts = self.path.trim_start_matches('/').split('/');
        match (parts.next(), parts.next()) {
            (Some("environments"), Some(env)) if !env.is_empty() => Some(env),
            _ => None,
        }
    }

    /// Field the operation touches: the segment after `environments/{env}`,
    /// or the first path segment for root fields
    #[must_use]
    pub fn field(&self) -> &str {
        let mut parts = self.path.trim_start_matches('/').split('/');
        let first = parts.next().unwrap_or_default();
        if first == "environments" {
            parts.nth(1).unwrap_or_default()
        } else {
            first
        }
    }

    /// Whether the operation appends to a collection (`add .../-`)
    #[inline]
    #[must_use]
    pub fn is_append(&self) -> bool {
        self.op == PatchOp::Add && self.path.ends_with("/-")
    }
}

/// Flag variation as known by the destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variation {
    /// Destination-assigned identifier
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Served value
    pub value: Value,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Variation {
    /// Create variation with a destination id
    #[must_use]
    pub fn new(id: impl Into<String>, value: Value) -> Self {
        Self {
            id: Some(id.into()),
            value,
            name: None,
            description: None,
        }
    }

    /// Parse the `variations` array of a flag document; malformed entries are dropped
    #[must_use]
    pub fn list_from_flag(flag: &Value) -> Vec<Variation> {
        flag.get("variations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| serde_json::from_value(v.clone()).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Lifecycle status of an approval request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting review
    Pending,
    /// Approved and scheduled
    Scheduled,
    /// Approved but applying failed
    Failed,
    /// Rejected by a reviewer
    Declined,
    /// Applied
    Completed,
    /// Anything this client does not know
    Unknown,
}

impl ApprovalStatus {
    /// Parse the API's status string
    #[must_use]
    pub fn parse(status: &str) -> Self {
        match status {
            "pending" => Self::Pending,
            "scheduled" => Self::Scheduled,
            "failed" => Self::Failed,
            "declined" => Self::Declined,
            "completed" => Self::Completed,
            _ => Self::Unknown,
        }
    }

    /// Whether an existing request with this status blocks creating another
    ///
    /// Pending, scheduled and failed requests always block. Declined requests
    /// block only when `block_on_declined` is set.
    #[inline]
    #[must_use]
    pub fn is_active(&self, block_on_declined: bool) -> bool {
        match self {
            Self::Pending | Self::Scheduled | Self::Failed => true,
            Self::Declined => block_on_declined,
            Self::Completed | Self::Unknown => false,
        }
    }
}

/// Change request for an approval-gated environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    /// Destination flag key
    pub flag_key: String,
    /// Destination environment key
    pub env: String,
    /// Reviewer-facing description
    pub description: String,
    /// Semantic instructions to apply once approved
    pub instructions: Vec<SemanticInstruction>,
    /// Members to notify
    pub notify_member_ids: Vec<String>,
}

impl ApprovalRequest {
    /// Wire body: `{description, instructions, notifyMemberIds?}`
    #[must_use]
    pub fn to_body(&self) -> Value {
        let mut body = json!({
            "description": self.description,
            "instructions": self.instructions,
        });
        if !self.notify_member_ids.is_empty() {
            body["notifyMemberIds"] = json!(self.notify_member_ids);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_scoped_path_parts() {
        let op = PatchOperation::replace("/environments/prod/offVariation", json!(1));
        assert_eq!(op.environment(), Some("prod"));
        assert_eq!(op.field(), "offVariation");
        assert!(!op.is_append());
    }

    #[test]
    fn rule_append_is_detected() {
        let op = PatchOperation::add("/environments/prod/rules/-", json!({}));
        assert_eq!(op.field(), "rules");
        assert!(op.is_append());
    }

    #[test]
    fn root_field_path() {
        let op = PatchOperation::replace("/included", json!(["a"]));
        assert_eq!(op.environment(), None);
        assert_eq!(op.field(), "included");
    }

    #[test]
    fn patch_op_serializes_as_json_patch() {
        let op = PatchOperation::remove("/environments/prod/targets");
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "remove", "path": "/environments/prod/targets"})
        );
    }

    #[test]
    fn variations_parse_from_flag() {
        let flag = json!({"variations": [
            {"_id": "a1", "value": true},
            {"_id": "b2", "value": false, "name": "off"},
        ]});
        let vars = Variation::list_from_flag(&flag);
        assert_eq!(vars.len(), 2);
        assert_eq!(vars[1].id.as_deref(), Some("b2"));
        assert_eq!(vars[1].name.as_deref(), Some("off"));
    }

    #[test]
    fn approval_status_activity() {
        assert!(ApprovalStatus::parse("pending").is_active(false));
        assert!(ApprovalStatus::parse("scheduled").is_active(false));
        assert!(ApprovalStatus::parse("failed").is_active(false));
        assert!(!ApprovalStatus::parse("declined").is_active(false));
        assert!(ApprovalStatus::parse("declined").is_active(true));
        assert!(!ApprovalStatus::parse("completed").is_active(true));
        assert_eq!(ApprovalStatus::parse("archived"), ApprovalStatus::Unknown);
    }

    #[test]
    fn approval_body_omits_empty_recipients() {
        let request = ApprovalRequest {
            flag_key: "f1".to_string(),
            env: "prod".to_string(),
            description: "migrate".to_string(),
            instructions: vec![SemanticInstruction::TurnFlagOn],
            notify_member_ids: vec![],
        };
        let body = request.to_body();
        assert!(body.get("notifyMemberIds").is_none());
        assert_eq!(body["instructions"][0]["kind"], "turnFlagOn");
    }
}
