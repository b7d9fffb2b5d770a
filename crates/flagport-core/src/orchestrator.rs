//! Migration orchestrator
//!
//! Drives one run: project (with environments) → view → segments per
//! environment → flags → view links. Every resource goes through lookup,
//! create-or-reuse with conflict retry, and a patch of whatever still differs.
//! Per-resource failures are recorded in the run log; only project-level
//! failures end the run.

use crate::config::MigrationConfig;
use crate::conflict::{ConflictDecision, ConflictResolver};
use crate::error::MigrationError;
use crate::fields::FieldFilter;
use crate::patch::{flag_environment_ops, segment_ops};
use crate::report::{
    ApprovalOutcome, ApprovalRecord, MigrationReport, ReportContext, ResourceFailure, RunLog,
};
use crate::source::SourceStore;
use crate::state::{MigrationState, StateTracker};
use crate::translate::translate;
use crate::types::{ApprovalRequest, ApprovalStatus, PatchOperation, ResourceType, Variation};
use chrono::{DateTime, Utc};
use flagport_api::{ApiClient, ApiError, ApiResponse, StatusCode};
use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use std::future::Future;

/// Comment attached to every patch
pub const PATCH_COMMENT: &str = "Migrated by flagport";

/// Flags linked to a view per request
pub const VIEW_LINK_CHUNK: usize = 50;

/// Outcome of the creation step
#[derive(Debug, Clone, PartialEq)]
enum Creation {
    /// Created under `key`
    Created { key: String },
    /// A resource under `key` already exists and is updated instead
    Existing { key: String },
    /// Dry run; nothing sent
    Planned { key: String },
    /// Recorded failure
    Failed,
}

/// Outcome of one environment patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchOutcome {
    Applied,
    Approval,
    Failed,
}

/// Runs a migration against one destination project
#[derive(Debug)]
pub struct MigrationOrchestrator<S> {
    config: MigrationConfig,
    client: ApiClient,
    source: S,
    resolver: ConflictResolver,
    operator: tokio::sync::OnceCell<Option<String>>,
}

impl<S: SourceStore> MigrationOrchestrator<S> {
    /// Create orchestrator
    ///
    /// # Errors
    /// `MigrationError::Config` when the configuration is invalid
    pub fn new(
        config: MigrationConfig,
        client: ApiClient,
        source: S,
    ) -> Result<Self, MigrationError> {
        config.validate()?;
        let resolver = ConflictResolver::new(config.conflict_prefix.clone());
        Ok(Self {
            config,
            client,
            source,
            resolver,
            operator: tokio::sync::OnceCell::new(),
        })
    }

    /// Configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Conflict resolver of this run
    #[inline]
    #[must_use]
    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    fn project(&self) -> &str {
        &self.config.destination_project
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.client.governor().clock().now_ms()).unwrap_or_default()
    }

    /// Destination key of a source environment, after renames
    fn dest_env(&self, source_env: &str) -> String {
        self.resolver.resolved_key(
            ResourceType::Environment,
            self.config.dest_environment_key(source_env),
        )
    }

    /// Run the migration
    ///
    /// # Errors
    /// Fatal errors only: destination project collision or creation failure,
    /// unreadable top-level source data, invalid configuration.
    pub async fn run(&self) -> Result<MigrationReport, MigrationError> {
        let started_at = self.now();
        tracing::info!(
            source = %self.config.source_project,
            destination = %self.project(),
            source_domain = %self.config.source_domain,
            destination_domain = %self.config.destination_domain,
            dry_run = self.config.dry_run,
            "migration started"
        );

        let environments = self.source_environments()?;
        let mut log = RunLog::new();

        self.migrate_project(&environments, &mut log).await?;

        let view = match &self.config.target_view {
            Some(view) => self.ensure_view(view, &mut log).await?,
            None => None,
        };

        if self.config.migrate_segments {
            for (source_env, _) in &environments {
                self.migrate_segments(source_env, &mut log).await;
            }
        }

        let flag_keys = self.source.flag_keys()?;
        let env_keys: Vec<&str> = environments.iter().map(|(key, _)| key.as_str()).collect();
        let env_keys = &env_keys;
        let flag_logs: Vec<RunLog> = stream::iter(flag_keys)
            .map(|key| async move { self.migrate_flag(&key, env_keys).await })
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;
        for flag_log in flag_logs {
            log.merge(flag_log);
        }

        if let Some(view) = view {
            let flags = log.migrated_flags().to_vec();
            self.link_view(&view, &flags, &mut log).await;
        }

        let stats = self.client.governor().stats();
        let report = MigrationReport::build(
            ReportContext {
                source_project: self.config.source_project.clone(),
                destination_project: self.project().to_string(),
                source_domain: self.config.source_domain.clone(),
                destination_domain: self.config.destination_domain.clone(),
                dry_run: self.config.dry_run,
                started_at,
                finished_at: self.now(),
                conflicts: self.resolver.resolutions(),
                conflict_report: self.resolver.report(),
                requests: stats.requests,
                rate_limited: stats.rejections,
            },
            log,
        );
        tracing::info!(
            status = report.status,
            flags = report.stats.flags_processed,
            errors = report.stats.errors,
            "migration finished"
        );
        Ok(report)
    }

    /// Allow-listed source environments, in source order
    fn source_environments(&self) -> Result<Vec<(String, Value)>, MigrationError> {
        let mut out = Vec::new();
        for env in self.source.environments()? {
            let Some(key) = env.get("key").and_then(Value::as_str) else {
                tracing::warn!("source environment without a key ignored");
                continue;
            };
            if self.config.includes_environment(key) {
                out.push((key.to_string(), env.clone()));
            }
        }
        Ok(out)
    }

    // ==================== Lookup / create ====================

    /// Body of a successful lookup; anything else counts as missing
    fn found(
        result: flagport_api::Result<ApiResponse>,
        resource_type: ResourceType,
        key: &str,
    ) -> Option<Value> {
        match result {
            Ok(resp) if resp.is_success() => Some(resp.body),
            Ok(resp) => {
                if resp.status != StatusCode::NOT_FOUND {
                    tracing::debug!(
                        resource = %resource_type,
                        key,
                        status = resp.code(),
                        "lookup failed; treating as missing"
                    );
                }
                None
            }
            Err(err) if err.is_transport() => {
                tracing::warn!(
                    resource = %resource_type,
                    key,
                    error = %err,
                    "lookup did not reach the destination; treating as missing"
                );
                None
            }
            Err(err) => {
                tracing::debug!(
                    resource = %resource_type,
                    key,
                    error = %err,
                    "lookup failed; treating as missing"
                );
                None
            }
        }
    }

    /// Create a resource, retrying under the conflict prefix once
    async fn create_with_retry<F, Fut>(
        &self,
        resource_type: ResourceType,
        scope: Option<&str>,
        payload: Map<String, Value>,
        tracker: &mut StateTracker,
        log: &mut RunLog,
        create: F,
    ) -> Result<Creation, MigrationError>
    where
        F: Fn(Value) -> Fut,
        Fut: Future<Output = flagport_api::Result<ApiResponse>>,
    {
        let original_key = payload
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let original_name = payload
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let mut body = Value::Object(payload);
        let failure = |key: &str, message: String| {
            let failure = ResourceFailure::new(resource_type, key, message);
            match scope {
                Some(env) => failure.in_env(env),
                None => failure,
            }
        };

        if self.config.dry_run {
            tracker.advance(MigrationState::Create)?;
            tracker.advance(MigrationState::Created)?;
            log.planned(resource_type, format!("create {resource_type} {original_key}"));
            return Ok(Creation::Planned { key: original_key });
        }

        loop {
            tracker.advance(MigrationState::Create)?;
            let key = body
                .get("key")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();

            let resp = match create(body.clone()).await {
                Ok(resp) => resp,
                Err(err) if err.is_fatal() => return Err(err.into()),
                Err(err) => {
                    tracker.advance(MigrationState::Failed)?;
                    log.failed(failure(&key, err.to_string()));
                    return Ok(Creation::Failed);
                }
            };

            if resp.is_success() {
                tracker.advance(MigrationState::Created)?;
                tracing::info!(resource = %resource_type, key = %key, "created");
                return Ok(Creation::Created { key });
            }

            if resp.status != StatusCode::CONFLICT {
                tracker.advance(MigrationState::Failed)?;
                log.failed(failure(&key, resp.message()).with_status(resp.code()));
                return Ok(Creation::Failed);
            }

            tracker.advance(MigrationState::ConflictRetry)?;
            match self.resolver.resolve_scoped(
                resource_type,
                scope,
                &original_key,
                original_name.as_deref(),
                &resp,
            ) {
                Ok(ConflictDecision::Retry { key, name }) => {
                    body["key"] = Value::String(key);
                    if let Some(name) = name {
                        body["name"] = Value::String(name);
                    }
                }
                Ok(ConflictDecision::UseExisting { key }) => {
                    tracker.advance(MigrationState::Skip)?;
                    tracing::info!(
                        resource = %resource_type,
                        key = %key,
                        "key taken; updating existing resource"
                    );
                    return Ok(Creation::Existing { key });
                }
                Err(err) => {
                    tracker.advance(MigrationState::Failed)?;
                    log.failed(failure(&original_key, err.to_string()).with_status(resp.code()));
                    return Ok(Creation::Failed);
                }
            }
        }
    }

    // ==================== Project / environments ====================

    async fn migrate_project(
        &self,
        environments: &[(String, Value)],
        log: &mut RunLog,
    ) -> Result<(), MigrationError> {
        let project = self.project();
        let mut tracker = StateTracker::new(ResourceType::Project, project);

        if let Some(existing) = Self::found(
            self.client.get_project(project).await,
            ResourceType::Project,
            project,
        ) {
            tracker.advance(MigrationState::Exists)?;
            tracker.advance(MigrationState::Skip)?;
            log.unchanged(ResourceType::Project);

            let present = environment_keys(&existing);
            for (source_env, document) in environments {
                self.ensure_environment(source_env, document, &present, log)
                    .await?;
            }
            return Ok(());
        }

        tracker.advance(MigrationState::NotExists)?;
        let mut payload = FieldFilter::create(ResourceType::Project).apply(&self.source.project()?);
        payload.insert("key".to_string(), json!(project));
        payload
            .entry("name")
            .or_insert_with(|| json!(project));
        let envs: Vec<Value> = environments
            .iter()
            .map(|(source_env, document)| {
                Value::Object(self.environment_payload(source_env, document))
            })
            .collect();
        payload.insert("environments".to_string(), Value::Array(envs));

        if self.config.dry_run {
            log.planned(
                ResourceType::Project,
                format!("create project {project} with {} environments", environments.len()),
            );
            return Ok(());
        }

        tracker.advance(MigrationState::Create)?;
        let resp = self.client.create_project(Value::Object(payload)).await?;
        if !resp.is_success() {
            tracker.advance(MigrationState::Failed)?;
            return Err(MigrationError::ProjectCreateFailed {
                key: project.to_string(),
                status: resp.code(),
                message: resp.message(),
            });
        }
        tracker.advance(MigrationState::Created)?;
        tracing::info!(project, environments = environments.len(), "project created");
        log.created(ResourceType::Project);
        for _ in environments {
            log.created(ResourceType::Environment);
        }
        Ok(())
    }

    fn environment_payload(&self, source_env: &str, document: &Value) -> Map<String, Value> {
        let mut payload = FieldFilter::create(ResourceType::Environment).apply(document);
        let dest = self.config.dest_environment_key(source_env);
        payload.insert("key".to_string(), json!(dest));
        payload.entry("name").or_insert_with(|| json!(dest));
        payload
            .entry("color")
            .or_insert_with(|| json!("417505"));
        payload
    }

    async fn ensure_environment(
        &self,
        source_env: &str,
        document: &Value,
        present: &[String],
        log: &mut RunLog,
    ) -> Result<(), MigrationError> {
        let dest = self.config.dest_environment_key(source_env);
        let mut tracker = StateTracker::new(ResourceType::Environment, dest);

        if present.iter().any(|key| key == dest) {
            tracker.advance(MigrationState::Exists)?;
            tracker.advance(MigrationState::Skip)?;
            log.unchanged(ResourceType::Environment);
            return Ok(());
        }

        tracker.advance(MigrationState::NotExists)?;
        let client = &self.client;
        let project = self.project();
        let creation = self
            .create_with_retry(
                ResourceType::Environment,
                None,
                self.environment_payload(source_env, document),
                &mut tracker,
                log,
                move |body| client.create_environment(project, body),
            )
            .await?;
        if let Creation::Created { .. } = creation {
            log.created(ResourceType::Environment);
        }
        Ok(())
    }

    // ==================== Views ====================

    /// Make sure the target view exists; returns the key to link flags to
    async fn ensure_view(
        &self,
        view: &str,
        log: &mut RunLog,
    ) -> Result<Option<String>, MigrationError> {
        let project = self.project();
        let mut tracker = StateTracker::new(ResourceType::View, view);

        let existing = self.client.get_view(project, view).await;
        if Self::found(existing, ResourceType::View, view).is_some() {
            tracker.advance(MigrationState::Exists)?;
            tracker.advance(MigrationState::Skip)?;
            log.unchanged(ResourceType::View);
            return Ok(Some(view.to_string()));
        }

        tracker.advance(MigrationState::NotExists)?;
        let mut payload = Map::new();
        payload.insert("key".to_string(), json!(view));
        payload.insert("name".to_string(), json!(view));
        let client = &self.client;
        let creation = self
            .create_with_retry(
                ResourceType::View,
                None,
                payload,
                &mut tracker,
                log,
                move |body| client.create_view(project, body),
            )
            .await?;

        Ok(match creation {
            Creation::Created { key } => {
                log.created(ResourceType::View);
                Some(key)
            }
            Creation::Existing { key } | Creation::Planned { key } => Some(key),
            Creation::Failed => None,
        })
    }

    async fn link_view(&self, view: &str, flags: &[String], log: &mut RunLog) {
        if flags.is_empty() {
            return;
        }
        if self.config.dry_run {
            log.planned(
                ResourceType::View,
                format!("link {} flags to view {view}", flags.len()),
            );
            return;
        }

        for chunk in flags.chunks(VIEW_LINK_CHUNK) {
            match self
                .client
                .link_flags_to_view(self.project(), view, chunk)
                .await
            {
                Ok(resp) if resp.is_success() => {
                    tracing::info!(view, flags = chunk.len(), "flags linked to view");
                }
                Ok(resp) => log.failed(
                    ResourceFailure::new(ResourceType::View, view, resp.message())
                        .with_status(resp.code()),
                ),
                Err(err) => {
                    log.failed(ResourceFailure::new(ResourceType::View, view, err.to_string()));
                }
            }
        }
    }

    // ==================== Segments ====================

    async fn migrate_segments(&self, source_env: &str, log: &mut RunLog) {
        let dest_env = self.dest_env(source_env);
        let segments = match self.source.segments(source_env) {
            Ok(segments) => segments,
            Err(err) => {
                log.failed(
                    ResourceFailure::new(ResourceType::Segment, "*", err.to_string())
                        .in_env(&dest_env),
                );
                return;
            }
        };

        for segment in &segments {
            let Some(key) = segment.get("key").and_then(Value::as_str) else {
                log.failed(
                    ResourceFailure::new(ResourceType::Segment, "?", "source segment without a key")
                        .in_env(&dest_env),
                );
                continue;
            };
            let mut tracker = StateTracker::new(ResourceType::Segment, key);
            if let Err(err) = self
                .migrate_segment(&dest_env, key, segment, &mut tracker, log)
                .await
            {
                log.failed(
                    ResourceFailure::new(ResourceType::Segment, key, err.to_string())
                        .in_env(&dest_env),
                );
            }
        }
    }

    async fn migrate_segment(
        &self,
        env: &str,
        key: &str,
        source: &Value,
        tracker: &mut StateTracker,
        log: &mut RunLog,
    ) -> Result<(), MigrationError> {
        let project = self.project();
        let client = &self.client;

        let (dest_key, current, created) = match Self::found(
            client.get_segment(project, env, key).await,
            ResourceType::Segment,
            key,
        ) {
            Some(body) => {
                tracker.advance(MigrationState::Exists)?;
                tracker.advance(MigrationState::Skip)?;
                (key.to_string(), Some(body), false)
            }
            None => {
                tracker.advance(MigrationState::NotExists)?;
                let payload = FieldFilter::create(ResourceType::Segment).apply(source);
                let creation = self
                    .create_with_retry(
                        ResourceType::Segment,
                        Some(env),
                        payload,
                        tracker,
                        log,
                        move |body| client.create_segment(project, env, body),
                    )
                    .await?;
                match creation {
                    Creation::Created { key } => {
                        log.created(ResourceType::Segment);
                        let current = Self::found(
                            client.get_segment(project, env, &key).await,
                            ResourceType::Segment,
                            &key,
                        );
                        (key, current, true)
                    }
                    Creation::Existing { key } => {
                        let current = Self::found(
                            client.get_segment(project, env, &key).await,
                            ResourceType::Segment,
                            &key,
                        );
                        (key, current, false)
                    }
                    Creation::Planned { key } => (key, None, true),
                    Creation::Failed => return Ok(()),
                }
            }
        };

        tracker.advance(MigrationState::PatchPending)?;
        let ops = segment_ops(source, current.as_ref(), |k| {
            self.resolver
                .resolved_key_scoped(ResourceType::Segment, Some(env), k)
        });

        if ops.is_empty() {
            tracker.advance(MigrationState::PatchApplied)?;
            if !created {
                log.unchanged(ResourceType::Segment);
            }
            return Ok(());
        }
        if self.config.dry_run {
            log.planned(
                ResourceType::Segment,
                format!("patch segment {dest_key} in {env} ({} operations)", ops.len()),
            );
            tracker.advance(MigrationState::PatchApplied)?;
            return Ok(());
        }

        let body = serde_json::to_value(&ops).map_err(ApiError::from)?;
        match client
            .patch_segment(project, env, &dest_key, body, PATCH_COMMENT)
            .await
        {
            Ok(resp) if resp.is_success() => {
                tracker.advance(MigrationState::PatchApplied)?;
                tracing::info!(segment = %dest_key, env, ops = ops.len(), "segment patched");
                if !created {
                    log.updated(ResourceType::Segment);
                }
            }
            Ok(resp) => {
                tracker.advance(MigrationState::PatchFailed)?;
                log.failed(
                    ResourceFailure::new(ResourceType::Segment, &dest_key, resp.message())
                        .in_env(env)
                        .with_status(resp.code()),
                );
            }
            Err(err) => {
                tracker.advance(MigrationState::PatchFailed)?;
                log.failed(
                    ResourceFailure::new(ResourceType::Segment, &dest_key, err.to_string())
                        .in_env(env),
                );
            }
        }
        Ok(())
    }

    // ==================== Flags ====================

    /// Migrate one flag; never fails, everything lands in the returned log
    async fn migrate_flag(&self, key: &str, environments: &[&str]) -> RunLog {
        let mut log = RunLog::new();
        log.flag_processed();

        let source = match self.source.flag(key) {
            Ok(source) => source,
            Err(err) => {
                log.failed(ResourceFailure::new(ResourceType::Flag, key, err.to_string()));
                return log;
            }
        };

        let mut tracker = StateTracker::new(ResourceType::Flag, key);
        if let Err(err) = self
            .migrate_flag_inner(key, &source, environments, &mut tracker, &mut log)
            .await
        {
            log.failed(ResourceFailure::new(ResourceType::Flag, key, err.to_string()));
        }
        log
    }

    async fn migrate_flag_inner(
        &self,
        key: &str,
        source: &Value,
        environments: &[&str],
        tracker: &mut StateTracker,
        log: &mut RunLog,
    ) -> Result<(), MigrationError> {
        let project = self.project();
        let client = &self.client;

        let (dest_key, destination, created) = match Self::found(
            client.get_flag(project, key).await,
            ResourceType::Flag,
            key,
        ) {
            Some(body) => {
                tracker.advance(MigrationState::Exists)?;
                tracker.advance(MigrationState::Skip)?;
                (key.to_string(), Some(body), false)
            }
            None => {
                tracker.advance(MigrationState::NotExists)?;
                let creation = self
                    .create_with_retry(
                        ResourceType::Flag,
                        None,
                        self.flag_payload(source),
                        tracker,
                        log,
                        move |body| client.create_flag(project, body),
                    )
                    .await?;
                match creation {
                    Creation::Created { key } => {
                        log.created(ResourceType::Flag);
                        let destination = self.read_back(&key, log).await;
                        if destination.is_none() {
                            return Ok(());
                        }
                        (key, destination, true)
                    }
                    Creation::Existing { key } => {
                        let destination = self.read_back(&key, log).await;
                        if destination.is_none() {
                            return Ok(());
                        }
                        (key, destination, false)
                    }
                    Creation::Planned { key } => (key, None, true),
                    Creation::Failed => return Ok(()),
                }
            }
        };
        log.migrated_flag(dest_key.clone());

        let variations = destination
            .as_ref()
            .map(Variation::list_from_flag)
            .unwrap_or_default();
        let maintainer = maintainer_id(source);
        let mut changed = false;

        for source_env in environments {
            let source_cfg = source.get("environments").and_then(|e| e.get(*source_env));
            let Some(source_cfg) = source_cfg else {
                continue;
            };
            let env = self.dest_env(source_env);
            let dest_cfg = destination
                .as_ref()
                .and_then(|d| d.get("environments"))
                .and_then(|e| e.get(&env));

            tracker.advance(MigrationState::PatchPending)?;
            let ops = flag_environment_ops(&env, source_cfg, dest_cfg, |k| {
                self.resolver
                    .resolved_key_scoped(ResourceType::Segment, Some(env.as_str()), k)
            });

            if ops.is_empty() {
                tracing::debug!(flag = %dest_key, env = %env, "already in sync");
                tracker.advance(MigrationState::PatchApplied)?;
                continue;
            }
            if self.config.dry_run {
                log.planned(
                    ResourceType::Flag,
                    format!("patch flag {dest_key} in {env} ({} operations)", ops.len()),
                );
                tracker.advance(MigrationState::PatchApplied)?;
                continue;
            }

            let outcome = self
                .patch_flag_environment(&dest_key, &env, &ops, &variations, maintainer, log)
                .await?;
            tracker.advance(match outcome {
                PatchOutcome::Applied => MigrationState::PatchApplied,
                PatchOutcome::Approval => MigrationState::ApprovalRequested,
                PatchOutcome::Failed => MigrationState::PatchFailed,
            })?;
            changed |= outcome == PatchOutcome::Applied;
        }

        if !created {
            if changed {
                log.updated(ResourceType::Flag);
            } else {
                log.unchanged(ResourceType::Flag);
            }
        }
        Ok(())
    }

    /// Create payload for a flag, with the maintainer mapped when enabled
    fn flag_payload(&self, source: &Value) -> Map<String, Value> {
        let mut payload = FieldFilter::create(ResourceType::Flag).apply(source);
        if let Some(member) = maintainer_id(source).and_then(|m| self.config.mapped_maintainer(m)) {
            payload.insert("maintainerId".to_string(), json!(member));
        }
        payload
    }

    /// Post-creation read: destination variation ids and current configuration
    async fn read_back(&self, key: &str, log: &mut RunLog) -> Option<Value> {
        match self.client.get_flag(self.project(), key).await {
            Ok(resp) if resp.is_success() => Some(resp.body),
            Ok(resp) => {
                log.failed(
                    ResourceFailure::new(
                        ResourceType::Flag,
                        key,
                        format!("read after create: {}", resp.message()),
                    )
                    .with_status(resp.code()),
                );
                None
            }
            Err(err) => {
                log.failed(ResourceFailure::new(
                    ResourceType::Flag,
                    key,
                    format!("read after create: {err}"),
                ));
                None
            }
        }
    }

    async fn patch_flag_environment(
        &self,
        flag: &str,
        env: &str,
        ops: &[PatchOperation],
        variations: &[Variation],
        maintainer: Option<&str>,
        log: &mut RunLog,
    ) -> Result<PatchOutcome, MigrationError> {
        let body = serde_json::to_value(ops).map_err(ApiError::from)?;
        let mut not_found = 0;

        loop {
            let resp = match self
                .client
                .patch_flag(self.project(), flag, body.clone(), PATCH_COMMENT)
                .await
            {
                Ok(resp) => resp,
                Err(err) => {
                    log.failed(
                        ResourceFailure::new(ResourceType::Flag, flag, err.to_string()).in_env(env),
                    );
                    return Ok(PatchOutcome::Failed);
                }
            };

            match resp.code() {
                200..=299 => {
                    tracing::info!(flag, env, ops = ops.len(), "flag patched");
                    return Ok(PatchOutcome::Applied);
                }
                405 => {
                    tracing::info!(flag, env, "environment requires approval");
                    return Ok(self
                        .request_approval(flag, env, ops, variations, maintainer, log)
                        .await);
                }
                404 if not_found < self.config.not_found_retries => {
                    not_found += 1;
                    tracing::warn!(
                        flag,
                        env,
                        attempt = not_found,
                        "flag not visible yet; retrying patch"
                    );
                    self.client
                        .governor()
                        .clock()
                        .sleep(self.config.not_found_retry_delay())
                        .await;
                }
                _ => {
                    log.failed(
                        ResourceFailure::new(ResourceType::Flag, flag, resp.message())
                            .in_env(env)
                            .with_status(resp.code()),
                    );
                    return Ok(PatchOutcome::Failed);
                }
            }
        }
    }

    // ==================== Approvals ====================

    async fn request_approval(
        &self,
        flag: &str,
        env: &str,
        ops: &[PatchOperation],
        variations: &[Variation],
        maintainer: Option<&str>,
        log: &mut RunLog,
    ) -> PatchOutcome {
        let project = self.project();

        match self.client.list_approval_requests(project, flag, env).await {
            Ok(resp) if resp.is_success() => {
                let block_on_declined = self.config.block_on_declined_approvals;
                let active = list_items(&resp.body).into_iter().find(|request| {
                    let status = request.get("status").and_then(Value::as_str).unwrap_or_default();
                    ApprovalStatus::parse(status).is_active(block_on_declined)
                });
                if let Some(active) = active {
                    tracing::info!(flag, env, "approval request already open");
                    log.approval(ApprovalRecord {
                        flag_key: flag.to_string(),
                        env: env.to_string(),
                        outcome: ApprovalOutcome::Existing,
                        instructions: 0,
                        request_id: active.get("_id").and_then(Value::as_str).map(str::to_string),
                    });
                    return PatchOutcome::Approval;
                }
            }
            Ok(resp) => {
                log.failed(
                    ResourceFailure::new(
                        ResourceType::Flag,
                        flag,
                        format!("cannot list approval requests: {}", resp.message()),
                    )
                    .in_env(env)
                    .with_status(resp.code()),
                );
                return PatchOutcome::Failed;
            }
            Err(err) => {
                log.failed(
                    ResourceFailure::new(
                        ResourceType::Flag,
                        flag,
                        format!("cannot list approval requests: {err}"),
                    )
                    .in_env(env),
                );
                return PatchOutcome::Failed;
            }
        }

        let translation = translate(ops, variations);
        log.skipped_fields(flag, env, translation.skipped_fields.clone());
        if translation.instructions.is_empty() {
            log.failed(
                ResourceFailure::new(
                    ResourceType::Flag,
                    flag,
                    "approval required but no change maps to an approval instruction",
                )
                .in_env(env)
                .with_status(StatusCode::METHOD_NOT_ALLOWED.as_u16()),
            );
            return PatchOutcome::Failed;
        }

        let request = ApprovalRequest {
            flag_key: flag.to_string(),
            env: env.to_string(),
            description: format!(
                "Migrate flag '{flag}' from project '{}'",
                self.config.source_project
            ),
            instructions: translation.instructions,
            notify_member_ids: self.approval_recipients(maintainer, flag, env).await,
        };

        match self
            .client
            .create_approval_request(project, flag, env, request.to_body())
            .await
        {
            Ok(resp) if resp.is_success() => {
                tracing::info!(
                    flag,
                    env,
                    instructions = request.instructions.len(),
                    "approval request submitted"
                );
                log.approval(ApprovalRecord {
                    flag_key: flag.to_string(),
                    env: env.to_string(),
                    outcome: ApprovalOutcome::Created,
                    instructions: request.instructions.len(),
                    request_id: resp.body.get("_id").and_then(Value::as_str).map(str::to_string),
                });
                PatchOutcome::Approval
            }
            Ok(resp) => {
                log.failed(
                    ResourceFailure::new(
                        ResourceType::Flag,
                        flag,
                        format!("approval request: {}", resp.message()),
                    )
                    .in_env(env)
                    .with_status(resp.code()),
                );
                PatchOutcome::Failed
            }
            Err(err) => {
                log.failed(
                    ResourceFailure::new(
                        ResourceType::Flag,
                        flag,
                        format!("approval request: {err}"),
                    )
                    .in_env(env),
                );
                PatchOutcome::Failed
            }
        }
    }

    /// Mapped maintainer, else the operator, else nobody
    async fn approval_recipients(
        &self,
        maintainer: Option<&str>,
        flag: &str,
        env: &str,
    ) -> Vec<String> {
        if let Some(member) = maintainer.and_then(|m| self.config.mapped_maintainer(m)) {
            return vec![member.to_string()];
        }
        if let Some(operator) = self.operator().await {
            return vec![operator];
        }
        tracing::warn!(flag, env, "no approval recipient; request will notify nobody");
        Vec::new()
    }

    /// Member owning the destination token, fetched once per run
    async fn operator(&self) -> Option<String> {
        self.operator
            .get_or_init(|| async {
                match self.client.current_member().await {
                    Ok(resp) if resp.is_success() => resp
                        .body
                        .get("_id")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    Ok(resp) => {
                        tracing::warn!(status = resp.code(), "cannot resolve current member");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "cannot resolve current member");
                        None
                    }
                }
            })
            .await
            .clone()
    }
}

/// Source maintainer id: `maintainerId`, or the embedded `_maintainer._id`
fn maintainer_id(flag: &Value) -> Option<&str> {
    flag.get("maintainerId")
        .and_then(Value::as_str)
        .or_else(|| {
            flag.get("_maintainer")
                .and_then(|m| m.get("_id"))
                .and_then(Value::as_str)
        })
}

/// Items of a list response: bare array or `{"items": [...]}`
fn list_items(body: &Value) -> Vec<&Value> {
    body.as_array()
        .or_else(|| body.get("items").and_then(Value::as_array))
        .map(|items| items.iter().collect())
        .unwrap_or_default()
}

/// Environment keys of a project document
fn environment_keys(project: &Value) -> Vec<String> {
    let Some(envs) = project.get("environments") else {
        return Vec::new();
    };
    list_items(envs)
        .into_iter()
        .filter_map(|env| env.get("key").and_then(Value::as_str))
        .map(str::to_string)
        .collect()
}
