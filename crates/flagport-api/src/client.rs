//! Typed endpoint calls against the destination API
//!
//! Each method builds exactly one request with the [`ApiGateway`] and hands it
//! to the shared [`RateGovernor`]. Responses are returned as-is: interpreting
//! status codes is the migration state machine's job. The one exception is a
//! 409 on project creation, which is fatal for the run.

use crate::error::{ApiError, Result};
use crate::rate::RateGovernor;
use crate::request::{ApiGateway, ApiRequest, RouteCategory};
use crate::transport::{ApiResponse, HttpTransport};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::sync::Arc;

/// Rate-governed client for one API host
#[derive(Clone)]
pub struct ApiClient {
    gateway: ApiGateway,
    governor: Arc<RateGovernor>,
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.gateway.base_url())
            .field("governor", &self.governor)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create client
    #[must_use]
    pub fn new(
        gateway: ApiGateway,
        governor: Arc<RateGovernor>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            gateway,
            governor,
            transport,
        }
    }

    /// Shared governor
    #[inline]
    #[must_use]
    pub fn governor(&self) -> &Arc<RateGovernor> {
        &self.governor
    }

    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let response = self
            .governor
            .dispatch(self.transport.as_ref(), &request)
            .await?;
        tracing::trace!(
            method = %request.method,
            path = %request.path,
            status = response.code(),
            "api call"
        );
        Ok(response)
    }

    // ==================== Projects ====================

    /// Fetch project with its environments expanded
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn get_project(&self, project: &str) -> Result<ApiResponse> {
        let path = format!("/api/v2/projects/{project}?expand=environments");
        self.send(self.gateway.get(RouteCategory::Projects, &path)).await
    }

    /// Create project
    ///
    /// # Errors
    /// `ApiError::ProjectConflict` when the key is already taken; a project
    /// collision leaves the destination in an unknown state.
    pub async fn create_project(&self, body: Value) -> Result<ApiResponse> {
        let key = body
            .get("key")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let response = self
            .send(self.gateway.post(RouteCategory::Projects, "/api/v2/projects", body))
            .await?;
        if response.status == StatusCode::CONFLICT {
            return Err(ApiError::ProjectConflict { key });
        }
        Ok(response)
    }

    // ==================== Environments ====================

    /// Create environment
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn create_environment(&self, project: &str, body: Value) -> Result<ApiResponse> {
        let path = format!("/api/v2/projects/{project}/environments");
        self.send(self.gateway.post(RouteCategory::Environments, &path, body))
            .await
    }

    // ==================== Flags ====================

    /// Fetch flag with all environment configurations
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn get_flag(&self, project: &str, flag: &str) -> Result<ApiResponse> {
        let path = format!("/api/v2/flags/{project}/{flag}");
        self.send(self.gateway.get(RouteCategory::Flags, &path)).await
    }

    /// Create flag
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn create_flag(&self, project: &str, body: Value) -> Result<ApiResponse> {
        let path = format!("/api/v2/flags/{project}");
        self.send(self.gateway.post(RouteCategory::Flags, &path, body))
            .await
    }

    /// Apply JSON-patch operations to a flag
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn patch_flag(
        &self,
        project: &str,
        flag: &str,
        ops: Value,
        comment: &str,
    ) -> Result<ApiResponse> {
        let path = format!("/api/v2/flags/{project}/{flag}");
        let body = json!({ "patch": ops, "comment": comment });
        self.send(self.gateway.patch(RouteCategory::Flags, &path, body))
            .await
    }

    // ==================== Segments ====================

    /// Fetch segment
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn get_segment(
        &self,
        project: &str,
        env: &str,
        segment: &str,
    ) -> Result<ApiResponse> {
        let path = format!("/api/v2/segments/{project}/{env}/{segment}");
        self.send(self.gateway.get(RouteCategory::Segments, &path)).await
    }

    /// Create segment
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn create_segment(
        &self,
        project: &str,
        env: &str,
        body: Value,
    ) -> Result<ApiResponse> {
        let path = format!("/api/v2/segments/{project}/{env}");
        self.send(self.gateway.post(RouteCategory::Segments, &path, body))
            .await
    }

    /// Apply JSON-patch operations to a segment
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn patch_segment(
        &self,
        project: &str,
        env: &str,
        segment: &str,
        ops: Value,
        comment: &str,
    ) -> Result<ApiResponse> {
        let path = format!("/api/v2/segments/{project}/{env}/{segment}");
        let body = json!({ "patch": ops, "comment": comment });
        self.send(self.gateway.patch(RouteCategory::Segments, &path, body))
            .await
    }

    // ==================== Views (beta) ====================

    /// Fetch view
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn get_view(&self, project: &str, view: &str) -> Result<ApiResponse> {
        let path = format!("/api/v2/projects/{project}/views/{view}");
        self.send(self.gateway.get(RouteCategory::Views, &path).beta())
            .await
    }

    /// Create view
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn create_view(&self, project: &str, body: Value) -> Result<ApiResponse> {
        let path = format!("/api/v2/projects/{project}/views");
        self.send(self.gateway.post(RouteCategory::Views, &path, body).beta())
            .await
    }

    /// Link flags to a view
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn link_flags_to_view(
        &self,
        project: &str,
        view: &str,
        flag_keys: &[String],
    ) -> Result<ApiResponse> {
        let path = format!("/api/v2/projects/{project}/views/{view}/link/flag");
        let body = json!({ "keys": flag_keys });
        self.send(self.gateway.post(RouteCategory::Views, &path, body).beta())
            .await
    }

    // ==================== Approval requests ====================

    /// List approval requests for a flag in one environment
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn list_approval_requests(
        &self,
        project: &str,
        flag: &str,
        env: &str,
    ) -> Result<ApiResponse> {
        let path = approval_path(project, flag, env);
        self.send(self.gateway.get(RouteCategory::ApprovalRequests, &path))
            .await
    }

    /// Submit approval request
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn create_approval_request(
        &self,
        project: &str,
        flag: &str,
        env: &str,
        body: Value,
    ) -> Result<ApiResponse> {
        let path = approval_path(project, flag, env);
        self.send(self.gateway.post(RouteCategory::ApprovalRequests, &path, body))
            .await
    }

    // ==================== Members ====================

    /// Member owning the access token
    ///
    /// # Errors
    /// `ApiError` on transport failure; any HTTP status is returned as a response
    pub async fn current_member(&self) -> Result<ApiResponse> {
        self.send(self.gateway.get(RouteCategory::Members, "/api/v2/members/me"))
            .await
    }
}

fn approval_path(project: &str, flag: &str, env: &str) -> String {
    format!("/api/v2/projects/{project}/flags/{flag}/environments/{env}/approval-requests")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::rate::GovernorConfig;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use reqwest::header::HeaderMap;
    use std::time::Duration;

    #[derive(Debug)]
    struct NoWait;

    #[async_trait]
    impl Clock for NoWait {
        fn now_ms(&self) -> i64 {
            0
        }

        async fn sleep(&self, _duration: Duration) {}
    }

    struct Recorder {
        status: StatusCode,
        requests: Mutex<Vec<ApiRequest>>,
    }

    #[async_trait]
    impl HttpTransport for Recorder {
        async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
            self.requests.lock().push(request.clone());
            Ok(ApiResponse::new(self.status, HeaderMap::new(), Value::Null))
        }
    }

    fn client(status: StatusCode) -> (ApiClient, Arc<Recorder>) {
        let recorder = Arc::new(Recorder {
            status,
            requests: Mutex::new(Vec::new()),
        });
        let governor = Arc::new(RateGovernor::with_config(
            Arc::new(NoWait),
            GovernorConfig::new().with_max_jitter(Duration::ZERO),
        ));
        let gateway = ApiGateway::new("api.test", "token").unwrap();
        (ApiClient::new(gateway, governor, recorder.clone()), recorder)
    }

    #[tokio::test]
    async fn project_conflict_is_fatal_error() {
        let (client, _) = client(StatusCode::CONFLICT);
        let err = client
            .create_project(json!({"key": "platform", "name": "Platform"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::ProjectConflict { ref key } if key == "platform"));
    }

    #[tokio::test]
    async fn flag_conflict_is_returned_as_response() {
        let (client, _) = client(StatusCode::CONFLICT);
        let resp = client.create_flag("p", json!({"key": "f1"})).await.unwrap();
        assert_eq!(resp.code(), 409);
    }

    #[tokio::test]
    async fn patch_wraps_ops_with_comment() {
        let (client, recorder) = client(StatusCode::OK);
        client
            .patch_flag(
                "p",
                "f1",
                json!([{"op": "replace", "path": "/environments/prod/on", "value": true}]),
                "migrated",
            )
            .await
            .unwrap();

        let requests = recorder.requests.lock();
        let body = requests[0].body.as_ref().unwrap();
        assert_eq!(body["comment"], "migrated");
        assert_eq!(body["patch"][0]["path"], "/environments/prod/on");
        assert_eq!(requests[0].path, "/api/v2/flags/p/f1");
    }

    #[tokio::test]
    async fn view_calls_use_beta_surface() {
        let (client, recorder) = client(StatusCode::OK);
        client
            .link_flags_to_view("p", "imported", &["f1".to_string()])
            .await
            .unwrap();

        let requests = recorder.requests.lock();
        assert_eq!(requests[0].headers.get("ld-api-version").unwrap(), "beta");
        assert_eq!(requests[0].route, RouteCategory::Views);
    }

    #[tokio::test]
    async fn approval_requests_are_scoped_to_flag_environment() {
        let (client, recorder) = client(StatusCode::OK);
        client.list_approval_requests("p", "f1", "prod").await.unwrap();
        assert_eq!(
            recorder.requests.lock()[0].path,
            "/api/v2/projects/p/flags/f1/environments/prod/approval-requests"
        );
    }
}
