//! Integration tests of the Zitadel client pipeline (auth injection,
//! retry, circuit breaker) against a mock IdP server.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use rolegate::config::Config;
use rolegate::failsafe::{CircuitBreaker, CircuitState};
use rolegate::upstream::{IdpClient, RoleInput, ZitadelClient};
use rolegate::Error;

fn test_config(server: &MockServer, retry_max: u32) -> Config {
    Config {
        zitadel_domain: server.uri(),
        service_account_token: "test-token".into(),
        project_id: "p1".into(),
        project_grant_id: "pg1".into(),
        retry_max,
        request_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn breaker_for(config: &Config) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "zitadel",
        config.cb_interval,
        config.cb_timeout,
        config.cb_max_requests,
    ))
}

fn make_client(server: &MockServer, retry_max: u32) -> (ZitadelClient, Arc<CircuitBreaker>) {
    let config = test_config(server, retry_max);
    let breaker = breaker_for(&config);
    let client = ZitadelClient::new(&config, Arc::clone(&breaker)).unwrap();
    (client, breaker)
}

#[tokio::test]
async fn get_user_roles_flattens_grants_without_dedup() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [
                { "grantId": "g1", "id": "x1", "roleKeys": ["admin", "auditor"] },
                { "id": "x2", "roleKeys": ["admin"] }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    let roles = client.get_user_roles("u1").await.unwrap();
    assert_eq!(roles, vec!["admin", "auditor", "admin"], "duplicates kept as-is");
}

#[tokio::test]
async fn client_errors_propagate_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such user"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, breaker) = make_client(&server, 3);
    let err = client.get_user_roles("u1").await.unwrap_err();
    match err {
        Error::UpstreamStatus { status, detail } => {
            assert_eq!(status, 404);
            assert!(detail.contains("no such user"));
        }
        other => panic!("expected UpstreamStatus, got {other:?}"),
    }
    // A 4xx is not a breaker failure.
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn server_errors_are_retried_to_exhaustion() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .expect(2)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 2);
    let err = client.get_user_roles("u1").await.unwrap_err();
    assert!(matches!(err, Error::UpstreamStatus { status: 502, .. }));
}

#[tokio::test]
async fn transient_server_error_recovers_within_one_logical_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{ "grantId": "g1", "roleKeys": ["admin"] }]
        })))
        .mount(&server)
        .await;

    let (client, breaker) = make_client(&server, 3);
    let roles = client.get_user_roles("u1").await.unwrap();
    assert_eq!(roles, vec!["admin"]);
    // The flap was absorbed inside one logical call: no breaker failure.
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn breaker_fails_fast_after_consecutive_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(502))
        .expect(5)
        .mount(&server)
        .await;

    let (client, breaker) = make_client(&server, 1);
    for _ in 0..5 {
        let err = client.get_user_roles("u1").await.unwrap_err();
        assert!(matches!(err, Error::UpstreamStatus { status: 502, .. }));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // The sixth call never reaches the network; the mock's expect(5)
    // verifies that on drop.
    let err = client.get_user_roles("u1").await.unwrap_err();
    assert!(matches!(err, Error::CircuitOpen(_)));
}

#[tokio::test]
async fn successful_probe_closes_the_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(5)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{ "grantId": "g1", "roleKeys": ["admin"] }]
        })))
        .mount(&server)
        .await;

    let mut config = test_config(&server, 1);
    config.cb_timeout = Duration::from_millis(100);
    let breaker = breaker_for(&config);
    let client = ZitadelClient::new(&config, Arc::clone(&breaker)).unwrap();

    for _ in 0..5 {
        client.get_user_roles("u1").await.unwrap_err();
    }
    assert!(matches!(
        client.get_user_roles("u1").await.unwrap_err(),
        Error::CircuitOpen(_)
    ));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let roles = client.get_user_roles("u1").await.unwrap();
    assert_eq!(roles, vec!["admin"]);
    assert_eq!(breaker.state(), CircuitState::Closed);

    // Fully recovered: the next call flows normally.
    assert!(client.get_user_roles("u1").await.is_ok());
}

#[tokio::test]
async fn create_roles_posts_bulk_and_returns_keys() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/projects/p1/roles/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "roles": [{ "key": "admin" }, { "key": "auditor" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    let keys = client
        .create_roles(&[
            RoleInput { name: "admin".into(), desc: "Admin".into() },
            RoleInput { name: "auditor".into(), desc: String::new() },
        ])
        .await
        .unwrap();
    assert_eq!(keys, vec!["admin", "auditor"]);
}

#[tokio::test]
async fn create_roles_tolerates_an_empty_response_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/projects/p1/roles/_bulk"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    let role_id = client.create_role("admin", "Admin").await.unwrap();
    assert_eq!(role_id, "", "empty id list degrades to an empty role id");
}

#[tokio::test]
async fn assign_roles_posts_grant_with_project_ids() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/u1/grants"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    client
        .assign_roles_to_user("u1", &["admin".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn assign_roles_with_empty_list_never_calls_upstream() {
    let server = MockServer::start().await;
    let (client, _) = make_client(&server, 3);
    client.assign_roles_to_user("u1", &[]).await.unwrap();
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn remove_role_deletes_the_grant_carrying_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [
                { "grantId": "", "id": "fallback", "roleKeys": ["viewer"] },
                { "grantId": "g2", "id": "x2", "roleKeys": ["admin"] }
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;
    // grantId preferred over id.
    Mock::given(method("DELETE"))
        .and(path("/management/v1/users/u1/grants/g2"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    client.remove_role_from_user("admin", "u1").await.unwrap();
}

#[tokio::test]
async fn remove_role_falls_back_to_grant_id_field() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{ "id": "only-id", "roleKeys": ["admin"] }]
        })))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/management/v1/users/u1/grants/only-id"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    client.remove_role_from_user("admin", "u1").await.unwrap();
}

#[tokio::test]
async fn remove_role_without_matching_grant_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/management/v1/users/grants/_search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{ "grantId": "g1", "roleKeys": ["viewer"] }]
        })))
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    let err = client.remove_role_from_user("admin", "u1").await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn delete_role_targets_the_project_role_path() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/management/v1/projects/p1/roles/admin"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _) = make_client(&server, 3);
    client.delete_role("admin").await.unwrap();
}
