//! Testing utilities for the flagport workspace
//!
//! Shared test doubles and fixtures:
//! - [`FakeClock`]: virtual time, sleeps return immediately
//! - [`FakeDestination`]: in-memory destination API behind `HttpTransport`
//! - [`MemorySource`]: extracted source project held in memory
//! - [`fixtures`]: source documents

#![allow(missing_docs)]

pub mod clock;
pub mod destination;
pub mod fixtures;
pub mod source;

pub use clock::FakeClock;
pub use destination::{FakeDestination, RecordedRequest};
pub use source::MemorySource;

use flagport_api::{ApiClient, ApiGateway, GovernorConfig, RateGovernor};
use std::sync::Arc;
use std::time::Duration;

/// API client wired to a fake destination and a fake clock, with no spacing or jitter
pub fn fake_client(destination: Arc<FakeDestination>, clock: Arc<FakeClock>) -> ApiClient {
    let governor = Arc::new(RateGovernor::with_config(
        clock,
        GovernorConfig::new()
            .with_min_spacing(Duration::ZERO)
            .with_max_jitter(Duration::ZERO),
    ));
    let gateway = ApiGateway::new("app.test", "api-test-token").unwrap();
    ApiClient::new(gateway, governor, destination)
}
