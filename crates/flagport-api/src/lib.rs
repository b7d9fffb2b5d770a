//! flagport API - rate-governed client for the feature-flag management API
//!
//! Provides:
//! - Request construction with auth, content and beta headers ([`ApiGateway`])
//! - Per-route adaptive rate limiting and 429 backoff ([`RateGovernor`])
//! - A transport seam with a `reqwest` implementation ([`HttpTransport`])
//! - Typed endpoint calls for migrations ([`ApiClient`])
//!
//! # Example
//!
//! ```rust,ignore
//! use flagport_api::{ApiClient, ApiGateway, RateGovernor, ReqwestTransport, SystemClock};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let governor = Arc::new(RateGovernor::new(Arc::new(SystemClock::new())));
//! let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(30))?);
//! let gateway = ApiGateway::new("app.example.com", "api-key")?;
//! let client = ApiClient::new(gateway, governor, transport);
//!
//! let flag = client.get_flag("platform", "new-checkout").await?;
//! println!("status {}", flag.code());
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod client;
pub mod clock;
pub mod error;
pub mod rate;
pub mod request;
pub mod transport;

pub use client::ApiClient;
pub use clock::{Clock, SystemClock};
pub use error::{ApiError, Result};
pub use rate::{GovernorConfig, GovernorStats, RateGovernor, RateLimitState, PROACTIVE_THRESHOLD};
pub use request::{ApiGateway, ApiRequest, RouteCategory, BETA_HEADER, BETA_HEADER_VALUE};
pub use transport::{ApiResponse, HttpTransport, ReqwestTransport};

/// Re-exported so callers can build and match responses without a direct dependency
pub use reqwest::{header, Method, StatusCode};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
