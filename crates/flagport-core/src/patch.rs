//! Patch construction with no-op filtering
//!
//! Compares the source configuration of a flag environment (or a segment)
//! against the destination and emits only the operations that change
//! something. Both sides are stripped of volatile fields before comparison,
//! so a second run over an already-migrated project produces no operations.

use crate::fields::{is_empty_value, FieldFilter, FLAG_ENVIRONMENT_FIELDS, SEGMENT_PATCH_FIELDS};
use crate::types::{PatchOperation, ResourceType};
use serde_json::Value;

/// Clause operator referencing segments by key
pub const SEGMENT_MATCH_OP: &str = "segmentMatch";

/// Operations bringing `dest_env` of a destination flag in line with a
/// source environment configuration
///
/// `destination` is the destination flag's configuration for that
/// environment, if known. `segment_key` maps a source segment key to its
/// destination key for `segmentMatch` clauses.
#[must_use]
pub fn flag_environment_ops(
    dest_env: &str,
    source: &Value,
    destination: Option<&Value>,
    segment_key: impl Fn(&str) -> String,
) -> Vec<PatchOperation> {
    diff_fields(
        &format!("/environments/{dest_env}"),
        FieldFilter::create(ResourceType::Flag),
        FLAG_ENVIRONMENT_FIELDS,
        source,
        destination,
        &segment_key,
    )
}

/// Operations bringing a destination segment in line with the source segment
#[must_use]
pub fn segment_ops(
    source: &Value,
    destination: Option<&Value>,
    segment_key: impl Fn(&str) -> String,
) -> Vec<PatchOperation> {
    diff_fields(
        "",
        FieldFilter::create(ResourceType::Segment),
        SEGMENT_PATCH_FIELDS,
        source,
        destination,
        &segment_key,
    )
}

fn diff_fields(
    prefix: &str,
    filter: FieldFilter,
    fields: &[&str],
    source: &Value,
    destination: Option<&Value>,
    segment_key: &dyn Fn(&str) -> String,
) -> Vec<PatchOperation> {
    let mut ops = Vec::new();

    for field in fields {
        let Some(wanted) = source.get(*field) else {
            continue;
        };
        let mut wanted = filter.strip_field(field, wanted);
        if *field == "rules" {
            rewrite_segment_refs(&mut wanted, segment_key);
        }
        let current = destination
            .and_then(|d| d.get(*field))
            .map(|current| filter.strip_field(field, current));

        match &current {
            Some(current) if *current == wanted => continue,
            Some(current) if is_empty_value(&wanted) && is_empty_value(current) => continue,
            None if is_empty_value(&wanted) => continue,
            _ => {}
        }

        let path = format!("{prefix}/{field}");
        let append_rules = *field == "rules" && current.as_ref().map_or(true, is_empty_value);
        match (append_rules, wanted) {
            (true, Value::Array(rules)) => {
                for rule in rules {
                    ops.push(PatchOperation::add(format!("{path}/-"), rule));
                }
            }
            (_, wanted) => ops.push(PatchOperation::replace(path, wanted)),
        }
    }

    ops
}

/// Rewrite `segmentMatch` clause values of a rules array in place
pub fn rewrite_segment_refs(rules: &mut Value, segment_key: &dyn Fn(&str) -> String) {
    let Some(rules) = rules.as_array_mut() else {
        return;
    };
    let clauses = rules
        .iter_mut()
        .filter_map(|rule| rule.get_mut("clauses").and_then(Value::as_array_mut))
        .flatten()
        .filter(|clause| clause.get("op").and_then(Value::as_str) == Some(SEGMENT_MATCH_OP));

    for clause in clauses {
        if let Some(values) = clause.get_mut("values").and_then(Value::as_array_mut) {
            for value in values.iter_mut() {
                if let Some(key) = value.as_str() {
                    *value = Value::String(segment_key(key));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PatchOp;
    use serde_json::json;

    fn same(key: &str) -> String {
        key.to_string()
    }

    #[test]
    fn fresh_destination_gets_every_non_empty_field() {
        let source = json!({
            "on": true,
            "offVariation": 1,
            "fallthrough": {"variation": 0},
            "rules": [],
            "targets": [],
            "trackEvents": false,
            "_summary": {"variations": {}}
        });
        let ops = flag_environment_ops("prod", &source, None, same);
        let paths: Vec<_> = ops.iter().map(|op| op.path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "/environments/prod/on",
                "/environments/prod/offVariation",
                "/environments/prod/fallthrough"
            ]
        );
    }

    #[test]
    fn identical_destination_yields_nothing() {
        let source = json!({
            "on": true,
            "offVariation": 1,
            "rules": [{"_id": "src", "clauses": [], "variation": 0}],
            "version": 7
        });
        let destination = json!({
            "on": true,
            "offVariation": 1,
            "rules": [{"_id": "dst", "clauses": [], "variation": 0}],
            "version": 2,
            "targets": []
        });
        assert!(flag_environment_ops("prod", &source, Some(&destination), same).is_empty());
    }

    #[test]
    fn turning_off_is_not_mistaken_for_empty() {
        let destination = json!({"on": true});
        let ops = flag_environment_ops("prod", &json!({"on": false}), Some(&destination), same);
        assert_eq!(ops, vec![PatchOperation::replace("/environments/prod/on", json!(false))]);
    }

    #[test]
    fn rules_append_into_empty_destination() {
        let source = json!({"rules": [
            {"clauses": [], "variation": 0},
            {"clauses": [], "variation": 1}
        ]});
        let ops = flag_environment_ops("prod", &source, Some(&json!({"rules": []})), same);
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|op| op.op == PatchOp::Add && op.is_append()));
    }

    #[test]
    fn rules_replace_when_destination_differs() {
        let source = json!({"rules": [{"clauses": [], "variation": 0}]});
        let destination = json!({"rules": [{"clauses": [], "variation": 1}]});
        let ops = flag_environment_ops("prod", &source, Some(&destination), same);
        assert_eq!(
            ops,
            vec![PatchOperation::replace(
                "/environments/prod/rules",
                json!([{"clauses": [], "variation": 0}])
            )]
        );
    }

    #[test]
    fn segment_references_are_rewritten() {
        let source = json!({"rules": [{
            "clauses": [
                {"attribute": "segmentMatch", "op": "segmentMatch", "values": ["vip", "beta"]},
                {"attribute": "country", "op": "in", "values": ["vip"]}
            ],
            "variation": 0
        }]});
        let resolve = |key: &str| {
            if key == "vip" {
                "imported-vip".to_string()
            } else {
                key.to_string()
            }
        };
        let ops = flag_environment_ops("prod", &source, None, resolve);
        let rule = ops[0].value.as_ref().unwrap();
        assert_eq!(rule["clauses"][0]["values"], json!(["imported-vip", "beta"]));
        assert_eq!(rule["clauses"][1]["values"], json!(["vip"]));
    }

    #[test]
    fn already_rewritten_destination_is_a_no_op() {
        let source = json!({"rules": [{
            "clauses": [{"op": "segmentMatch", "values": ["vip"]}],
            "variation": 0
        }]});
        let destination = json!({"rules": [{
            "clauses": [{"op": "segmentMatch", "values": ["imported-vip"]}],
            "variation": 0
        }]});
        let ops = flag_environment_ops("prod", &source, Some(&destination), |_| {
            "imported-vip".to_string()
        });
        assert!(ops.is_empty());
    }

    #[test]
    fn clause_values_named_like_server_fields_are_compared() {
        let source = json!({"rules": [{
            "_id": "src",
            "clauses": [{"attribute": "build", "op": "in", "values": [{"version": 2}]}],
            "variation": 0
        }]});
        let destination = json!({"rules": [{
            "_id": "dst",
            "clauses": [{"attribute": "build", "op": "in", "values": [{"version": 1}]}],
            "variation": 0
        }]});
        let ops = flag_environment_ops("prod", &source, Some(&destination), same);
        assert_eq!(ops.len(), 1);
        let rules = ops[0].value.as_ref().unwrap();
        assert_eq!(rules[0]["clauses"][0]["values"], json!([{"version": 2}]));
        assert!(rules[0].get("_id").is_none());
    }

    #[test]
    fn segment_ops_use_root_paths() {
        let source = json!({"key": "vip", "included": ["u1", "u2"], "excluded": [], "rules": []});
        let ops = segment_ops(&source, Some(&json!({"included": [], "excluded": []})), same);
        assert_eq!(ops, vec![PatchOperation::replace("/included", json!(["u1", "u2"]))]);
    }
}
