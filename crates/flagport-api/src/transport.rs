//! HTTP transport seam
//!
//! The governor dispatches through [`HttpTransport`]; production code uses
//! [`ReqwestTransport`], tests substitute a scripted fake.

use crate::error::Result;
use crate::request::ApiRequest;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

/// Response as seen by the migration engine
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Parsed JSON body (`Value::Null` when empty or not JSON)
    pub body: Value,
}

impl ApiResponse {
    /// Create response from parts
    #[inline]
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Value) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Status code as a number
    #[inline]
    #[must_use]
    pub fn code(&self) -> u16 {
        self.status.as_u16()
    }

    /// 2xx
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Read a header as UTF-8 text
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Deserialize the body
    ///
    /// # Errors
    /// `ApiError::Json` if the body does not match `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Short human-readable summary of the body for error reports
    #[must_use]
    pub fn message(&self) -> String {
        match &self.body {
            Value::Null => self
                .status
                .canonical_reason()
                .unwrap_or("no body")
                .to_string(),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| self.body.to_string(), str::to_string),
            other => other.to_string(),
        }
    }
}

/// Sends one request and returns the raw response
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send request
    ///
    /// # Errors
    /// Network failures only; non-2xx statuses are returned as responses
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse>;
}

/// [`HttpTransport`] backed by `reqwest`
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create transport with a request timeout
    ///
    /// # Errors
    /// `ApiError::Http` if the TLS backend cannot be initialised
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("flagport/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };

        Ok(ApiResponse::new(status, headers, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_prefers_message_field() {
        let resp = ApiResponse::new(
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            json!({"code": "invalid_request", "message": "rules malformed"}),
        );
        assert_eq!(resp.message(), "rules malformed");
    }

    #[test]
    fn message_falls_back_to_reason() {
        let resp = ApiResponse::new(StatusCode::NOT_FOUND, HeaderMap::new(), Value::Null);
        assert_eq!(resp.message(), "Not Found");
    }

    #[test]
    fn json_deserializes_body() {
        #[derive(serde::Deserialize)]
        struct Member {
            #[serde(rename = "_id")]
            id: String,
        }

        let resp = ApiResponse::new(StatusCode::OK, HeaderMap::new(), json!({"_id": "m-1"}));
        let member: Member = resp.json().unwrap();
        assert_eq!(member.id, "m-1");
    }
}
