//! Run outcomes and the end-of-run report
//!
//! Workers record what happened into a [`RunLog`] they own; logs are merged
//! once the flag stream completes and turned into a [`MigrationReport`].

use crate::conflict::ConflictResolution;
use crate::types::ResourceType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Per-resource-type outcome counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceCounts {
    /// Created in the destination
    pub created: usize,
    /// Existed and received at least one change
    pub updated: usize,
    /// Existed and already matched
    pub unchanged: usize,
    /// Writes that a dry run would have sent
    pub planned: usize,
    /// Failed (see errors)
    pub failed: usize,
}

/// Whether the approval request was submitted by this run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalOutcome {
    /// Submitted now
    Created,
    /// An active request was already there
    Existing,
}

/// One approval request touched by the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalRecord {
    /// Destination flag key
    pub flag_key: String,
    /// Destination environment
    pub env: String,
    /// Created or found
    pub outcome: ApprovalOutcome,
    /// Instructions submitted (zero for existing requests)
    pub instructions: usize,
    /// Server-side request id, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Fields an approval request could not carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFields {
    /// Destination flag key
    pub flag_key: String,
    /// Destination environment
    pub env: String,
    /// Field names, apply manually after approval
    pub fields: Vec<String>,
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    /// Resource type
    pub resource_type: ResourceType,
    /// Key (destination key when resolved)
    pub key: String,
    /// Environment, for environment-scoped steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<String>,
    /// HTTP status, when the failure came from a response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// What went wrong
    pub message: String,
}

impl ResourceFailure {
    /// Failure of `key` with a message
    #[must_use]
    pub fn new(
        resource_type: ResourceType,
        key: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource_type,
            key: key.into(),
            env: None,
            status: None,
            message: message.into(),
        }
    }

    /// In environment
    #[inline]
    #[must_use]
    pub fn in_env(mut self, env: impl Into<String>) -> Self {
        self.env = Some(env.into());
        self
    }

    /// With HTTP status
    #[inline]
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.resource_type, self.key)?;
        if let Some(env) = &self.env {
            write!(f, " [{env}]")?;
        }
        if let Some(status) = self.status {
            write!(f, " ({status})")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Outcome accumulator owned by one worker
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    counts: BTreeMap<ResourceType, ResourceCounts>,
    approvals: Vec<ApprovalRecord>,
    skipped: Vec<SkippedFields>,
    errors: Vec<ResourceFailure>,
    planned: Vec<String>,
    migrated_flags: Vec<String>,
    flags_processed: usize,
}

impl RunLog {
    /// Empty log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counts(&mut self, resource_type: ResourceType) -> &mut ResourceCounts {
        self.counts.entry(resource_type).or_default()
    }

    /// Count a creation
    pub fn created(&mut self, resource_type: ResourceType) {
        self.counts(resource_type).created += 1;
    }

    /// Count an update of an existing resource
    pub fn updated(&mut self, resource_type: ResourceType) {
        self.counts(resource_type).updated += 1;
    }

    /// Count an existing resource that needed nothing
    pub fn unchanged(&mut self, resource_type: ResourceType) {
        self.counts(resource_type).unchanged += 1;
    }

    /// Record a write withheld by dry run
    pub fn planned(&mut self, resource_type: ResourceType, description: impl Into<String>) {
        let description = description.into();
        tracing::info!(resource = %resource_type, "dry run: would {description}");
        self.counts(resource_type).planned += 1;
        self.planned.push(description);
    }

    /// Record a failure
    pub fn failed(&mut self, failure: ResourceFailure) {
        tracing::warn!(failure = %failure, "resource failed");
        self.counts(failure.resource_type).failed += 1;
        self.errors.push(failure);
    }

    /// Record an approval request
    pub fn approval(&mut self, record: ApprovalRecord) {
        self.approvals.push(record);
    }

    /// Record fields left out of an approval request
    pub fn skipped_fields(&mut self, flag_key: &str, env: &str, fields: Vec<String>) {
        if fields.is_empty() {
            return;
        }
        self.skipped.push(SkippedFields {
            flag_key: flag_key.to_string(),
            env: env.to_string(),
            fields,
        });
    }

    /// Record a flag that exists in the destination after this run
    pub fn migrated_flag(&mut self, key: impl Into<String>) {
        self.migrated_flags.push(key.into());
    }

    /// Count a processed flag
    pub fn flag_processed(&mut self) {
        self.flags_processed += 1;
    }

    /// Destination keys of migrated flags, in order
    #[must_use]
    pub fn migrated_flags(&self) -> &[String] {
        &self.migrated_flags
    }

    /// Recorded failures
    #[must_use]
    pub fn errors(&self) -> &[ResourceFailure] {
        &self.errors
    }

    /// Recorded approvals
    #[must_use]
    pub fn approvals(&self) -> &[ApprovalRecord] {
        &self.approvals
    }

    /// Append another log, keeping order
    pub fn merge(&mut self, other: RunLog) {
        for (resource_type, counts) in other.counts {
            let mine = self.counts(resource_type);
            mine.created += counts.created;
            mine.updated += counts.updated;
            mine.unchanged += counts.unchanged;
            mine.planned += counts.planned;
            mine.failed += counts.failed;
        }
        self.approvals.extend(other.approvals);
        self.skipped.extend(other.skipped);
        self.errors.extend(other.errors);
        self.planned.extend(other.planned);
        self.migrated_flags.extend(other.migrated_flags);
        self.flags_processed += other.flags_processed;
    }
}

/// Run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MigrationRunStats {
    /// Flags processed
    pub flags_processed: usize,
    /// Approval requests submitted
    pub approvals_created: usize,
    /// Keys renamed by the conflict resolver
    pub conflicts_resolved: usize,
    /// Recorded failures
    pub errors: usize,
}

/// End-of-run report
#[derive(Debug, Clone, Serialize)]
pub struct MigrationReport {
    /// Source project key
    pub source_project: String,
    /// Destination project key
    pub destination_project: String,
    /// Source API host
    pub source_domain: String,
    /// Destination API host
    pub destination_domain: String,
    /// Whether writes were withheld
    pub dry_run: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// `complete` or `partial`
    pub status: &'static str,
    /// Counters
    pub stats: MigrationRunStats,
    /// Outcome counts per resource type
    pub resources: BTreeMap<ResourceType, ResourceCounts>,
    /// Applied renames, in order
    pub conflicts: Vec<ConflictResolution>,
    /// Conflict report text
    pub conflict_report: String,
    /// Approval requests per flag
    pub approvals: BTreeMap<String, Vec<ApprovalRecord>>,
    /// `flag/env` pairs waiting on a reviewer
    pub pending_approvals: Vec<String>,
    /// Fields to apply manually after approval
    pub skipped_fields: Vec<SkippedFields>,
    /// Recorded failures
    pub errors: Vec<ResourceFailure>,
    /// Writes a dry run withheld
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<String>,
    /// Requests sent through the rate governor
    pub requests: u64,
    /// 429 responses received
    pub rate_limited: u64,
}

/// Inputs to [`MigrationReport::build`] that do not come from the run log
#[derive(Debug, Clone)]
pub struct ReportContext {
    /// Source project key
    pub source_project: String,
    /// Destination project key
    pub destination_project: String,
    /// Source API host
    pub source_domain: String,
    /// Destination API host
    pub destination_domain: String,
    /// Dry run flag
    pub dry_run: bool,
    /// Run start
    pub started_at: DateTime<Utc>,
    /// Run end
    pub finished_at: DateTime<Utc>,
    /// Applied renames
    pub conflicts: Vec<ConflictResolution>,
    /// Conflict report text
    pub conflict_report: String,
    /// Requests sent
    pub requests: u64,
    /// 429 responses
    pub rate_limited: u64,
}

impl MigrationReport {
    /// Assemble the report from a merged run log
    #[must_use]
    pub fn build(ctx: ReportContext, log: RunLog) -> Self {
        let mut approvals: BTreeMap<String, Vec<ApprovalRecord>> = BTreeMap::new();
        let mut pending_approvals = Vec::new();
        for record in log.approvals {
            pending_approvals.push(format!("{}/{}", record.flag_key, record.env));
            approvals
                .entry(record.flag_key.clone())
                .or_default()
                .push(record);
        }

        let stats = MigrationRunStats {
            flags_processed: log.flags_processed,
            approvals_created: approvals
                .values()
                .flatten()
                .filter(|r| r.outcome == ApprovalOutcome::Created)
                .count(),
            conflicts_resolved: ctx.conflicts.len(),
            errors: log.errors.len(),
        };

        Self {
            source_project: ctx.source_project,
            destination_project: ctx.destination_project,
            source_domain: ctx.source_domain,
            destination_domain: ctx.destination_domain,
            dry_run: ctx.dry_run,
            started_at: ctx.started_at,
            finished_at: ctx.finished_at,
            status: if log.errors.is_empty() { "complete" } else { "partial" },
            stats,
            resources: log.counts,
            conflicts: ctx.conflicts,
            conflict_report: ctx.conflict_report,
            approvals,
            pending_approvals,
            skipped_fields: log.skipped,
            errors: log.errors,
            planned: log.planned,
            requests: ctx.requests,
            rate_limited: ctx.rate_limited,
        }
    }

    /// Whether every resource migrated without a recorded failure
    #[inline]
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        self.errors.is_empty()
    }

    /// Counts for one resource type
    #[must_use]
    pub fn counts(&self, resource_type: ResourceType) -> ResourceCounts {
        self.resources.get(&resource_type).copied().unwrap_or_default()
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Migration {} → {}{}: {}",
            self.source_project,
            self.destination_project,
            if self.dry_run { " (dry run)" } else { "" },
            self.status
        )?;
        let elapsed = self.finished_at - self.started_at;
        writeln!(
            f,
            "Duration: {}.{:03}s, {} requests, {} rate limited",
            elapsed.num_seconds(),
            elapsed.num_milliseconds().rem_euclid(1000),
            self.requests,
            self.rate_limited
        )?;

        writeln!(f, "Resources:")?;
        for (resource_type, c) in &self.resources {
            writeln!(
                f,
                "  {resource_type}: {} created, {} updated, {} unchanged, {} planned, {} failed",
                c.created, c.updated, c.unchanged, c.planned, c.failed
            )?;
        }

        f.write_str(&self.conflict_report)?;

        if !self.approvals.is_empty() {
            writeln!(f, "Approval requests:")?;
            for (flag, records) in &self.approvals {
                let envs: Vec<String> = records
                    .iter()
                    .map(|r| match r.outcome {
                        ApprovalOutcome::Created => r.env.clone(),
                        ApprovalOutcome::Existing => format!("{} (existing)", r.env),
                    })
                    .collect();
                writeln!(f, "  {flag}: {}", envs.join(", "))?;
            }
            writeln!(f, "Pending approvals: {}", self.pending_approvals.join(", "))?;
        }

        if !self.skipped_fields.is_empty() {
            writeln!(f, "Apply manually after approval:")?;
            for s in &self.skipped_fields {
                writeln!(f, "  {}/{}: {}", s.flag_key, s.env, s.fields.join(", "))?;
            }
        }

        if !self.errors.is_empty() {
            writeln!(f, "Errors ({}):", self.errors.len())?;
            for e in &self.errors {
                writeln!(f, "  {e}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ctx() -> ReportContext {
        let started_at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap_or_default();
        ReportContext {
            source_project: "legacy".to_string(),
            destination_project: "platform".to_string(),
            source_domain: "app.launchdarkly.com".to_string(),
            destination_domain: "app.eu.launchdarkly.com".to_string(),
            dry_run: false,
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(1500),
            conflicts: Vec::new(),
            conflict_report: "Conflict resolutions: 0\n".to_string(),
            requests: 12,
            rate_limited: 1,
        }
    }

    fn approval(flag: &str, env: &str, outcome: ApprovalOutcome) -> ApprovalRecord {
        ApprovalRecord {
            flag_key: flag.to_string(),
            env: env.to_string(),
            outcome,
            instructions: 2,
            request_id: None,
        }
    }

    #[test]
    fn merge_keeps_order_and_sums_counts() {
        let mut a = RunLog::new();
        a.created(ResourceType::Flag);
        a.migrated_flag("f1");
        a.flag_processed();
        let mut b = RunLog::new();
        b.created(ResourceType::Flag);
        b.updated(ResourceType::Flag);
        b.migrated_flag("f2");
        b.flag_processed();

        a.merge(b);
        assert_eq!(a.migrated_flags(), ["f1".to_string(), "f2".to_string()]);
        let report = MigrationReport::build(ctx(), a);
        assert_eq!(report.counts(ResourceType::Flag).created, 2);
        assert_eq!(report.counts(ResourceType::Flag).updated, 1);
        assert_eq!(report.stats.flags_processed, 2);
        assert!(report.is_complete_success());
    }

    #[test]
    fn approvals_group_by_flag() {
        let mut log = RunLog::new();
        log.approval(approval("f1", "prod", ApprovalOutcome::Created));
        log.approval(approval("f2", "prod", ApprovalOutcome::Existing));
        log.approval(approval("f1", "staging", ApprovalOutcome::Created));

        let report = MigrationReport::build(ctx(), log);
        assert_eq!(report.approvals["f1"].len(), 2);
        assert_eq!(report.stats.approvals_created, 2);
        assert_eq!(report.pending_approvals, vec!["f1/prod", "f2/prod", "f1/staging"]);
    }

    #[test]
    fn display_lists_partial_status_and_errors() {
        let mut log = RunLog::new();
        log.created(ResourceType::Segment);
        log.approval(approval("f1", "prod", ApprovalOutcome::Created));
        log.skipped_fields("f1", "prod", vec!["targets".to_string()]);
        log.failed(ResourceFailure {
            resource_type: ResourceType::Flag,
            key: "f2".to_string(),
            env: Some("prod".to_string()),
            status: Some(500),
            message: "internal error".to_string(),
        });

        let report = MigrationReport::build(ctx(), log);
        assert!(!report.is_complete_success());
        assert_eq!(
            report.to_string(),
            "Migration legacy → platform: partial\n\
             Duration: 1.500s, 12 requests, 1 rate limited\n\
             Resources:\n  \
             segment: 1 created, 0 updated, 0 unchanged, 0 planned, 0 failed\n  \
             flag: 0 created, 0 updated, 0 unchanged, 0 planned, 1 failed\n\
             Conflict resolutions: 0\n\
             Approval requests:\n  \
             f1: prod\n\
             Pending approvals: f1/prod\n\
             Apply manually after approval:\n  \
             f1/prod: targets\n\
             Errors (1):\n  \
             flag 'f2' [prod] (500): internal error\n"
        );
    }

    #[test]
    fn serializes_status_and_type_keys() {
        let mut log = RunLog::new();
        log.planned(ResourceType::Flag, "create flag f1");
        let mut ctx = ctx();
        ctx.dry_run = true;
        let json = serde_json::to_value(MigrationReport::build(ctx, log)).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["resources"]["flag"]["planned"], 1);
        assert_eq!(json["planned"][0], "create flag f1");
        assert_eq!(json["source_domain"], "app.launchdarkly.com");
        assert_eq!(json["destination_domain"], "app.eu.launchdarkly.com");
    }
}
