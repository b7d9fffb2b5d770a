//! End-to-end checks of the reqwest transport behind the rate governor.
//!
//! These run against a local wiremock server so the real HTTP stack (headers,
//! JSON bodies, status handling) is exercised without touching the network.

use flagport_api::{
    ApiClient, ApiGateway, GovernorConfig, RateGovernor, ReqwestTransport, RouteCategory,
    SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client_for(server: &MockServer) -> ApiClient {
    let governor = Arc::new(RateGovernor::with_config(
        Arc::new(SystemClock::new()),
        GovernorConfig::new()
            .with_min_spacing(Duration::ZERO)
            .with_max_jitter(Duration::ZERO),
    ));
    let transport = Arc::new(ReqwestTransport::new(Duration::from_secs(5)).unwrap());
    let gateway = ApiGateway::new(&server.uri(), "api-test-token").unwrap();
    ApiClient::new(gateway, governor, transport)
}

#[tokio::test]
async fn get_flag_sends_auth_and_parses_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/flags/platform/new-checkout"))
        .and(header("authorization", "api-test-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-route-remaining", "2")
                .insert_header("x-ratelimit-reset", "4102444800000")
                .set_body_json(json!({"key": "new-checkout", "variations": []})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client.get_flag("platform", "new-checkout").await.unwrap();

    assert!(resp.is_success());
    assert_eq!(resp.body["key"], "new-checkout");

    let state = client.governor().state(RouteCategory::Flags).unwrap();
    assert_eq!(state.route_remaining, Some(2));
    assert_eq!(state.reset_ms, Some(4_102_444_800_000));
}

#[tokio::test]
async fn patch_sends_json_body() {
    let server = MockServer::start().await;
    let ops = json!([{"op": "replace", "path": "/environments/prod/on", "value": true}]);
    Mock::given(method("PATCH"))
        .and(path("/api/v2/flags/platform/f1"))
        .and(header("content-type", "application/json"))
        .and(body_json(json!({"patch": ops.clone(), "comment": "migrated"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"key": "f1"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client.patch_flag("platform", "f1", ops, "migrated").await.unwrap();
    assert_eq!(resp.code(), 200);
}

#[tokio::test]
async fn too_many_requests_is_retried_until_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/members/me"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v2/members/me"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_id": "m-42"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client.current_member().await.unwrap();

    assert_eq!(resp.body["_id"], "m-42");
    assert_eq!(client.governor().stats().rejections, 1);
}

#[tokio::test]
async fn empty_body_becomes_null() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v2/segments/platform/prod/vip"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let resp = client.get_segment("platform", "prod", "vip").await.unwrap();
    assert_eq!(resp.code(), 404);
    assert!(resp.body.is_null());
}
