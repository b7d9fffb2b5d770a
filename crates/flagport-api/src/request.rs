//! Request construction
//!
//! [`ApiGateway`] turns an endpoint and a body into an [`ApiRequest`]. It never
//! sends anything: dispatch belongs to the [`RateGovernor`](crate::RateGovernor).

use crate::error::{ApiError, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header opting into the beta API surface
pub const BETA_HEADER: &str = "LD-API-Version";

/// Value sent with [`BETA_HEADER`]
pub const BETA_HEADER_VALUE: &str = "beta";

/// Logical grouping of endpoints sharing a rate-limit bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteCategory {
    /// Project endpoints
    Projects,
    /// Environment endpoints
    Environments,
    /// Flag endpoints
    Flags,
    /// Segment endpoints
    Segments,
    /// Approval request endpoints
    ApprovalRequests,
    /// View endpoints (beta)
    Views,
    /// Member endpoints
    Members,
}

impl RouteCategory {
    /// Category name as used in logs and reports
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteCategory::Projects => "projects",
            RouteCategory::Environments => "environments",
            RouteCategory::Flags => "flags",
            RouteCategory::Segments => "segments",
            RouteCategory::ApprovalRequests => "approval-requests",
            RouteCategory::Views => "views",
            RouteCategory::Members => "members",
        }
    }
}

impl std::fmt::Display for RouteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully built request, ready for dispatch
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Path relative to the API host (used for logs and test routing)
    pub path: String,
    /// Rate-limit bucket
    pub route: RouteCategory,
    /// Headers to send
    pub headers: HeaderMap,
    /// JSON body for write verbs
    pub body: Option<Value>,
}

impl ApiRequest {
    /// Opt into the beta API surface
    #[must_use]
    pub fn beta(mut self) -> Self {
        self.headers.insert(
            HeaderName::from_static("ld-api-version"),
            HeaderValue::from_static(BETA_HEADER_VALUE),
        );
        self
    }

    /// Whether the request writes to the destination
    #[inline]
    #[must_use]
    pub fn is_write(&self) -> bool {
        self.method != Method::GET
    }
}

/// Builds authenticated requests against one API host
#[derive(Debug, Clone)]
pub struct ApiGateway {
    base_url: String,
    auth: HeaderValue,
}

impl ApiGateway {
    /// Create gateway for a domain
    ///
    /// A bare hostname gets an `https://` scheme; a value that already carries
    /// a scheme is used verbatim.
    ///
    /// # Errors
    /// `ApiError::Transport` if the token is not a valid header value
    pub fn new(domain: &str, token: &str) -> Result<Self> {
        let trimmed = domain.trim_end_matches('/');
        let base_url = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };

        let mut auth = HeaderValue::from_str(token)
            .map_err(|_| ApiError::Transport("access token is not a valid header value".into()))?;
        auth.set_sensitive(true);

        Ok(Self { base_url, auth })
    }

    /// Base URL requests are built against
    #[inline]
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Build GET request
    #[must_use]
    pub fn get(&self, route: RouteCategory, path: &str) -> ApiRequest {
        self.build(Method::GET, route, path, None)
    }

    /// Build POST request
    #[must_use]
    pub fn post(&self, route: RouteCategory, path: &str, body: Value) -> ApiRequest {
        self.build(Method::POST, route, path, Some(body))
    }

    /// Build PATCH request
    #[must_use]
    pub fn patch(&self, route: RouteCategory, path: &str, body: Value) -> ApiRequest {
        self.build(Method::PATCH, route, path, Some(body))
    }

    fn build(
        &self,
        method: Method,
        route: RouteCategory,
        path: &str,
        body: Option<Value>,
    ) -> ApiRequest {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth.clone());

        let mut request = ApiRequest {
            url: format!("{}{}", self.base_url, path),
            path: path.to_string(),
            method,
            route,
            headers,
            body,
        };
        if request.is_write() {
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gateway() -> ApiGateway {
        ApiGateway::new("app.example.com", "api-123").unwrap()
    }

    #[test]
    fn bare_domain_gets_https_scheme() {
        assert_eq!(gateway().base_url(), "https://app.example.com");
    }

    #[test]
    fn explicit_scheme_is_kept() {
        let gw = ApiGateway::new("http://127.0.0.1:8080/", "t").unwrap();
        assert_eq!(gw.base_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn get_carries_auth_but_no_content_type() {
        let req = gateway().get(RouteCategory::Flags, "/api/v2/flags/p/f");
        assert_eq!(req.url, "https://app.example.com/api/v2/flags/p/f");
        assert_eq!(req.headers.get(AUTHORIZATION).unwrap(), "api-123");
        assert!(req.headers.get(CONTENT_TYPE).is_none());
        assert!(!req.is_write());
    }

    #[test]
    fn write_verbs_carry_json_content_type() {
        let req = gateway().patch(RouteCategory::Flags, "/api/v2/flags/p/f", json!([]));
        assert_eq!(req.headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(req.is_write());
    }

    #[test]
    fn beta_adds_version_header() {
        let req = gateway()
            .post(RouteCategory::Views, "/api/v2/projects/p/views", json!({}))
            .beta();
        assert_eq!(req.headers.get(BETA_HEADER).unwrap(), "beta");
    }

    #[test]
    fn invalid_token_is_rejected() {
        assert!(ApiGateway::new("app.example.com", "bad\ntoken").is_err());
    }

    #[test]
    fn route_names_are_stable() {
        assert_eq!(RouteCategory::ApprovalRequests.to_string(), "approval-requests");
    }
}
