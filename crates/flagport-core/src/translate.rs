//! Semantic patch translation
//!
//! Approval-gated environments reject raw field patches and accept only a
//! closed vocabulary of semantic instructions. [`translate`] maps the generic
//! [`PatchOperation`]s built for direct patching onto that vocabulary.
//!
//! # Mapping
//! - `on` → `turnFlagOn` / `turnFlagOff`
//! - `offVariation` → `updateOffVariation`
//! - `fallthrough` → `updateFallthroughVariationOrRollout`
//! - append to `rules` → `addRule`
//! - anything else → reported in `skipped_fields`
//!
//! Patch values reference variations by index; instructions need the
//! destination's variation ids. An index that does not resolve drops that
//! instruction without an error.

use crate::fields::FieldFilter;
use crate::types::{PatchOp, PatchOperation, ResourceType, Variation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Instruction accepted by the approval-request API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SemanticInstruction {
    /// Turn targeting on
    TurnFlagOn,
    /// Turn targeting off
    TurnFlagOff,
    /// Change the variation served while off
    UpdateOffVariation {
        /// Destination variation id
        #[serde(rename = "variationId")]
        variation_id: String,
    },
    /// Change the default rule
    UpdateFallthroughVariationOrRollout {
        /// Fixed variation
        #[serde(rename = "variationId", default, skip_serializing_if = "Option::is_none")]
        variation_id: Option<String>,
        /// Percentage rollout, weight per variation id
        #[serde(rename = "rolloutWeights", default, skip_serializing_if = "Option::is_none")]
        rollout_weights: Option<BTreeMap<String, u64>>,
        /// Attribute to bucket by
        #[serde(rename = "rolloutBucketBy", default, skip_serializing_if = "Option::is_none")]
        rollout_bucket_by: Option<String>,
    },
    /// Append a targeting rule
    AddRule {
        /// Rule clauses
        clauses: Vec<Value>,
        /// Rule description
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        /// Fixed variation
        #[serde(rename = "variationId", default, skip_serializing_if = "Option::is_none")]
        variation_id: Option<String>,
        /// Percentage rollout, weight per variation id
        #[serde(rename = "rolloutWeights", default, skip_serializing_if = "Option::is_none")]
        rollout_weights: Option<BTreeMap<String, u64>>,
        /// Attribute to bucket by
        #[serde(rename = "rolloutBucketBy", default, skip_serializing_if = "Option::is_none")]
        rollout_bucket_by: Option<String>,
    },
}

impl SemanticInstruction {
    /// Wire name of the instruction
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TurnFlagOn => "turnFlagOn",
            Self::TurnFlagOff => "turnFlagOff",
            Self::UpdateOffVariation { .. } => "updateOffVariation",
            Self::UpdateFallthroughVariationOrRollout { .. } => {
                "updateFallthroughVariationOrRollout"
            }
            Self::AddRule { .. } => "addRule",
        }
    }
}

/// Result of translating a patch
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Translation {
    /// Instructions, in patch order
    pub instructions: Vec<SemanticInstruction>,
    /// Fields with no instruction equivalent (apply manually after approval)
    pub skipped_fields: Vec<String>,
}

/// Resolved serve target of a fallthrough or rule
enum Serve {
    Variation(String),
    Rollout {
        weights: BTreeMap<String, u64>,
        bucket_by: Option<String>,
    },
}

impl Serve {
    fn into_parts(self) -> (Option<String>, Option<BTreeMap<String, u64>>, Option<String>) {
        match self {
            Serve::Variation(id) => (Some(id), None, None),
            Serve::Rollout { weights, bucket_by } => (None, Some(weights), bucket_by),
        }
    }
}

/// Translate patch operations into semantic instructions
#[must_use]
pub fn translate(ops: &[PatchOperation], variations: &[Variation]) -> Translation {
    let mut translation = Translation::default();

    for op in ops {
        let value = op.value.as_ref().unwrap_or(&Value::Null);
        let field = op.field();

        let instruction = match (field, op.op) {
            ("on", PatchOp::Add | PatchOp::Replace) => match value.as_bool() {
                Some(true) => Some(SemanticInstruction::TurnFlagOn),
                Some(false) => Some(SemanticInstruction::TurnFlagOff),
                None => None,
            },
            ("offVariation", PatchOp::Add | PatchOp::Replace) => variation_id(value, variations)
                .map(|variation_id| SemanticInstruction::UpdateOffVariation { variation_id }),
            ("fallthrough", PatchOp::Add | PatchOp::Replace) => {
                resolve_serve(value, variations).map(|serve| {
                    let (variation_id, rollout_weights, rollout_bucket_by) = serve.into_parts();
                    SemanticInstruction::UpdateFallthroughVariationOrRollout {
                        variation_id,
                        rollout_weights,
                        rollout_bucket_by,
                    }
                })
            }
            ("rules", _) if op.is_append() => add_rule(value, variations),
            _ => {
                if !translation.skipped_fields.iter().any(|f| f == field) {
                    translation.skipped_fields.push(field.to_string());
                }
                continue;
            }
        };

        match instruction {
            Some(instruction) => translation.instructions.push(instruction),
            None => tracing::debug!(
                path = %op.path,
                "variation reference did not resolve; instruction omitted"
            ),
        }
    }

    translation
}

fn variation_id(index: &Value, variations: &[Variation]) -> Option<String> {
    let index = usize::try_from(index.as_u64()?).ok()?;
    variations.get(index)?.id.clone()
}

fn resolve_serve(target: &Value, variations: &[Variation]) -> Option<Serve> {
    if let Some(index) = target.get("variation").filter(|v| !v.is_null()) {
        return variation_id(index, variations).map(Serve::Variation);
    }

    let rollout = target.get("rollout")?;
    let mut weights = BTreeMap::new();
    for entry in rollout.get("variations")?.as_array()? {
        let id = variation_id(entry.get("variation")?, variations)?;
        let weight = entry.get("weight").and_then(Value::as_u64).unwrap_or(0);
        weights.insert(id, weight);
    }
    let bucket_by = rollout
        .get("bucketBy")
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(Serve::Rollout { weights, bucket_by })
}

fn add_rule(rule: &Value, variations: &[Variation]) -> Option<SemanticInstruction> {
    let serve = resolve_serve(rule, variations)?;
    let clauses = rule
        .get("clauses")
        .map(|c| FieldFilter::create(ResourceType::Flag).strip_field("clauses", c))
        .and_then(|c| match c {
            Value::Array(clauses) => Some(clauses),
            _ => None,
        })
        .unwrap_or_default();
    let description = rule
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .map(str::to_string);
    let (variation_id, rollout_weights, rollout_bucket_by) = serve.into_parts();

    Some(SemanticInstruction::AddRule {
        clauses,
        description,
        variation_id,
        rollout_weights,
        rollout_bucket_by,
    })
}
