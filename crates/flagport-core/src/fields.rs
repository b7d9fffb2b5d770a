//! Field allow/deny lists per resource type
//!
//! Source documents are the API's responses re-serialized verbatim. Before a
//! document becomes a create payload or is compared against the destination,
//! it is cut down to the fields that resource type accepts, and volatile
//! (server-owned) fields are stripped from the server-shaped objects it holds:
//! variations, rules, clauses, targets. User data such as variation values,
//! clause values and custom properties is never touched.

use crate::types::ResourceType;
use serde_json::{Map, Value};

/// Server-owned fields, removed from server-shaped objects
pub const VOLATILE_FIELDS: &[&str] = &[
    "_id",
    "_links",
    "_version",
    "_site",
    "_access",
    "_summary",
    "_status",
    "_maintainer",
    "_lastModified",
    "_creationDate",
    "_debugEventsUntilDate",
    "creationDate",
    "lastModified",
    "salt",
    "sel",
    "version",
];

/// Fields accepted when creating a project
pub const PROJECT_CREATE_FIELDS: &[&str] = &[
    "key",
    "name",
    "tags",
    "defaultClientSideAvailability",
    "includeInSnippetByDefault",
];

/// Fields accepted when creating an environment
pub const ENVIRONMENT_CREATE_FIELDS: &[&str] = &[
    "key",
    "name",
    "color",
    "defaultTtl",
    "secureMode",
    "defaultTrackEvents",
    "confirmChanges",
    "requireComments",
    "tags",
    "critical",
];

/// Fields accepted when creating a flag
pub const FLAG_CREATE_FIELDS: &[&str] = &[
    "key",
    "name",
    "description",
    "kind",
    "variations",
    "temporary",
    "tags",
    "clientSideAvailability",
    "defaults",
    "customProperties",
];

/// Per-environment flag fields migrated by patch, in application order
pub const FLAG_ENVIRONMENT_FIELDS: &[&str] = &[
    "on",
    "offVariation",
    "fallthrough",
    "rules",
    "targets",
    "contextTargets",
    "prerequisites",
    "trackEvents",
    "trackEventsFallthrough",
];

/// Fields accepted when creating a segment
pub const SEGMENT_CREATE_FIELDS: &[&str] = &[
    "key",
    "name",
    "description",
    "tags",
    "unbounded",
    "unboundedContextKind",
];

/// Segment fields migrated by patch after creation
pub const SEGMENT_PATCH_FIELDS: &[&str] = &[
    "included",
    "excluded",
    "includedContexts",
    "excludedContexts",
    "rules",
];

/// Flag fields holding server-shaped objects; stripping descends into these
/// and nowhere else, so variation values and custom properties stay intact
pub const FLAG_NESTED_FIELDS: &[&str] = &[
    "variations",
    "rules",
    "clauses",
    "targets",
    "contextTargets",
    "prerequisites",
    "fallthrough",
    "rollout",
];

/// Segment fields holding server-shaped objects
pub const SEGMENT_NESTED_FIELDS: &[&str] = &[
    "rules",
    "clauses",
    "includedContexts",
    "excludedContexts",
];

/// Fields accepted when creating a view
pub const VIEW_CREATE_FIELDS: &[&str] = &["key", "name", "description", "tags"];

const FLAT: &[&str] = &[];

/// Allow list and server-owned structure of one resource type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldFilter {
    allow: &'static [&'static str],
    nested: &'static [&'static str],
}

impl FieldFilter {
    /// Filter for creation payloads of a resource type
    #[must_use]
    pub fn create(resource_type: ResourceType) -> Self {
        let (allow, nested) = match resource_type {
            ResourceType::Project => (PROJECT_CREATE_FIELDS, FLAT),
            ResourceType::Environment => (ENVIRONMENT_CREATE_FIELDS, FLAT),
            ResourceType::Segment => (SEGMENT_CREATE_FIELDS, SEGMENT_NESTED_FIELDS),
            ResourceType::Flag => (FLAG_CREATE_FIELDS, FLAG_NESTED_FIELDS),
            ResourceType::View => (VIEW_CREATE_FIELDS, FLAT),
        };
        Self { allow, nested }
    }

    /// Allowed, present, non-null fields of `source` with volatile fields stripped
    #[must_use]
    pub fn apply(&self, source: &Value) -> Map<String, Value> {
        let mut out = Map::new();
        let Some(object) = source.as_object() else {
            return out;
        };
        for field in self.allow {
            if let Some(value) = object.get(*field) {
                if !value.is_null() {
                    out.insert((*field).to_string(), self.strip_field(field, value));
                }
            }
        }
        out
    }

    /// Value of `field` with volatile fields removed from the server-shaped
    /// objects it holds; fields that are not server-shaped come back unchanged
    #[must_use]
    pub fn strip_field(&self, field: &str, value: &Value) -> Value {
        if self.nested.contains(&field) {
            self.strip_container(value)
        } else {
            value.clone()
        }
    }

    fn strip_container(&self, value: &Value) -> Value {
        match value {
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.strip_node(item)).collect())
            }
            Value::Object(_) => self.strip_node(value),
            other => other.clone(),
        }
    }

    fn strip_node(&self, value: &Value) -> Value {
        let Value::Object(map) = value else {
            return value.clone();
        };
        Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), self.strip_field(k, v)))
                .collect(),
        )
    }
}

/// Null, `false`, empty array, or empty object
#[must_use]
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_server_ids_from_rules_and_clauses() {
        let rules = json!([{
            "_id": "r1",
            "clauses": [{"_id": "c1", "attribute": "email", "op": "in", "values": ["a"]}],
            "variation": 0
        }]);
        assert_eq!(
            FieldFilter::create(ResourceType::Flag).strip_field("rules", &rules),
            json!([{
                "clauses": [{"attribute": "email", "op": "in", "values": ["a"]}],
                "variation": 0
            }])
        );
    }

    #[test]
    fn user_data_keeps_keys_named_like_server_fields() {
        let flag = json!({
            "key": "theme",
            "variations": [
                {"_id": "v1", "value": {"version": "2.1", "salt": "s", "color": "red"}},
                {"_id": "v2", "value": {"_id": "x", "color": "blue"}}
            ],
            "customProperties": {"version": {"name": "Version", "value": ["3"]}},
            "defaults": {"onVariation": 0, "offVariation": 1}
        });
        let payload = FieldFilter::create(ResourceType::Flag).apply(&flag);
        assert_eq!(
            Value::Object(payload),
            json!({
                "key": "theme",
                "variations": [
                    {"value": {"version": "2.1", "salt": "s", "color": "red"}},
                    {"value": {"_id": "x", "color": "blue"}}
                ],
                "customProperties": {"version": {"name": "Version", "value": ["3"]}},
                "defaults": {"onVariation": 0, "offVariation": 1}
            })
        );
    }

    #[test]
    fn clause_values_are_not_stripped() {
        let clauses = json!([
            {"_id": "c1", "attribute": "meta", "op": "in", "values": [{"version": 1}]}
        ]);
        assert_eq!(
            FieldFilter::create(ResourceType::Segment).strip_field("clauses", &clauses),
            json!([{"attribute": "meta", "op": "in", "values": [{"version": 1}]}])
        );
    }

    #[test]
    fn create_filter_keeps_only_allowed_fields() {
        let flag = json!({
            "key": "f1",
            "name": "F1",
            "_links": {"self": {}},
            "creationDate": 1,
            "environments": {"prod": {}},
            "variations": [{"_id": "v1", "value": true}],
            "description": null
        });
        let payload = FieldFilter::create(ResourceType::Flag).apply(&flag);
        assert_eq!(
            Value::Object(payload),
            json!({"key": "f1", "name": "F1", "variations": [{"value": true}]})
        );
    }

    #[test]
    fn non_object_source_gives_empty_payload() {
        assert!(FieldFilter::create(ResourceType::Segment).apply(&json!([1])).is_empty());
    }

    #[test]
    fn empty_values() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!(false)));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(true)));
    }
}
