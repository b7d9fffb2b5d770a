//! Source documents shaped like verbatim API responses

use serde_json::{json, Value};

pub fn environment(key: &str) -> Value {
    json!({
        "_id": format!("src-env-{key}"),
        "_links": {"self": {"href": format!("/api/v2/projects/source/environments/{key}")}},
        "key": key,
        "name": key,
        "color": "7B42BC",
        "defaultTtl": 0,
        "secureMode": false,
        "tags": [],
        "confirmChanges": false,
        "requireComments": false
    })
}

/// Boolean flag with variations `[true, false]` and no environment configuration
pub fn boolean_flag(key: &str) -> Value {
    json!({
        "key": key,
        "name": key,
        "description": "",
        "kind": "boolean",
        "_version": 4,
        "creationDate": 1_690_000_000_000_i64,
        "_links": {"self": {"href": format!("/api/v2/flags/source/{key}")}},
        "_maintainer": {"_id": "src-member-1", "email": "owner@example.com"},
        "maintainerId": "src-member-1",
        "variations": [
            {"_id": format!("src-{key}-0"), "value": true},
            {"_id": format!("src-{key}-1"), "value": false}
        ],
        "temporary": false,
        "tags": ["checkout"],
        "environments": {}
    })
}

/// Copy of `flag` with `config` as the configuration of `env`
pub fn with_env(mut flag: Value, env: &str, config: Value) -> Value {
    flag["environments"][env] = config;
    flag
}

/// Environment configuration shaped like an API response
pub fn env_config(on: bool, off_variation: u64, rules: Value) -> Value {
    json!({
        "_site": {"href": "/default/prod/features/x"},
        "_summary": {"variations": {}},
        "on": on,
        "archived": false,
        "salt": "abc123",
        "sel": "def456",
        "lastModified": 1_690_000_000_000_i64,
        "version": 7,
        "offVariation": off_variation,
        "fallthrough": {"variation": 0},
        "rules": rules,
        "targets": [],
        "contextTargets": [],
        "prerequisites": [],
        "trackEvents": false,
        "trackEventsFallthrough": false
    })
}

/// Rule serving `variation` to members of `segment`
pub fn segment_rule(segment: &str, variation: u64) -> Value {
    json!({
        "_id": format!("src-rule-{segment}"),
        "clauses": [{
            "_id": format!("src-clause-{segment}"),
            "attribute": "segmentMatch",
            "op": "segmentMatch",
            "values": [segment],
            "negate": false
        }],
        "variation": variation,
        "trackEvents": false
    })
}

pub fn segment(key: &str, included: &[&str]) -> Value {
    json!({
        "key": key,
        "name": key.to_uppercase(),
        "description": format!("{key} users"),
        "tags": [],
        "creationDate": 1_690_000_000_000_i64,
        "_links": {"self": {"href": format!("/api/v2/segments/source/prod/{key}")}},
        "included": included,
        "excluded": [],
        "rules": [],
        "version": 2
    })
}
