//! Token refresh seen from the API client: one refresh per stale token,
//! however many requests notice it at once.

use std::sync::Arc;
use std::time::Duration;

use common::{ApiConfig, ManualClock, OAuthConfig};
use github_auth::{Authenticator, MemoryBackend, OAuthEndpoints, TokenRecord, TokenStore};
use github_client::{Error, GitHubClient, RetryPolicy};
use provider::CredentialProvider;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const T0: u64 = 1_700_000_000;

struct Harness {
    server: MockServer,
    auth: Arc<Authenticator>,
    client: GitHubClient,
}

async fn harness(active: TokenRecord) -> Harness {
    let server = MockServer::start().await;
    let clock = Arc::new(ManualClock::at_unix(T0));
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(TokenStore::open(backend, clock.clone()).await.unwrap());
    store.save(active).await.unwrap();

    let auth = Arc::new(
        Authenticator::new(
            store,
            reqwest::Client::new(),
            &OAuthConfig::default(),
            clock.clone(),
            RetryPolicy::default(),
        )
        .with_endpoints(OAuthEndpoints::with_origin(&server.uri())),
    );
    let config = ApiConfig {
        base_url: server.uri(),
        ..ApiConfig::default()
    };
    let client = GitHubClient::new(&config, reqwest::Client::new(), auth.clone(), clock).unwrap();
    Harness {
        server,
        auth,
        client,
    }
}

fn refreshable(access: &str, created_at: u64) -> TokenRecord {
    TokenRecord {
        expires_in: Some(28800),
        refresh_token: Some("ghr_old".into()),
        refresh_token_expires_in: Some(15811200),
        ..TokenRecord::new(access, "github.com", created_at)
    }
}

async fn mount_refresh(server: &MockServer, delay: Duration) {
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({
                    "access_token": "gho_new",
                    "refresh_token": "ghr_new",
                    "expires_in": 28800,
                    "refresh_token_expires_in": 15811200
                }))
                .set_delay(delay),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_user(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", "Bearer ghu_old"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "message": "Bad credentials"
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .and(header("authorization", "Bearer gho_new"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "login": "octocat"
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn concurrent_expired_lookups_refresh_once() {
    let h = harness(refreshable("ghu_old", T0 - 28800)).await;
    mount_refresh(&h.server, Duration::from_millis(200)).await;

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let auth = h.auth.clone();
            tokio::spawn(async move { auth.credential().await })
        })
        .collect();

    for task in tasks {
        let token = task.await.unwrap().unwrap();
        assert_eq!(token.secret().expose(), "gho_new");
    }
    assert_eq!(h.auth.store().len().await, 1);
    assert_eq!(h.auth.active_token().await.unwrap().expose(), "gho_new");
}

#[tokio::test]
async fn unauthorized_response_refreshes_and_retries_once() {
    let h = harness(refreshable("ghu_old", T0)).await;
    mount_refresh(&h.server, Duration::ZERO).await;
    mount_user(&h.server).await;

    let user = h.client.get("/user", None).await.unwrap();
    assert_eq!(user.data["login"], "octocat");
    assert_eq!(h.auth.active_token().await.unwrap().expose(), "gho_new");
}

#[tokio::test]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let h = harness(refreshable("ghu_old", T0)).await;
    mount_refresh(&h.server, Duration::from_millis(100)).await;
    mount_user(&h.server).await;

    let client = Arc::new(h.client);
    let tasks: Vec<_> = (0..5)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.get("/user", None).await })
        })
        .collect();

    for task in tasks {
        let user = task.await.unwrap().unwrap();
        assert_eq!(user.data["login"], "octocat");
    }
}

#[tokio::test]
async fn non_refreshable_token_rejected_requires_login() {
    let h = harness(TokenRecord::new("ghp_revoked", "github.com", T0)).await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "message": "Bad credentials"
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    let err = h.client.get("/user", None).await.unwrap_err();
    assert!(err.is_authentication_required());
    assert!(matches!(err, Error::AuthenticationRequired(_)));
}

#[tokio::test]
async fn rejected_refresh_requires_login() {
    let h = harness(refreshable("ghu_old", T0)).await;
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "error": "bad_refresh_token"
        })))
        .expect(1)
        .mount(&h.server)
        .await;
    mount_user(&h.server).await;

    let err = h.client.get("/user", None).await.unwrap_err();
    assert!(err.is_authentication_required());
    assert_eq!(h.auth.store().len().await, 1);
}

#[tokio::test]
async fn no_token_means_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let clock = Arc::new(ManualClock::at_unix(T0));
    let backend = Arc::new(MemoryBackend::new());
    let store = Arc::new(TokenStore::open(backend, clock.clone()).await.unwrap());
    let auth = Arc::new(Authenticator::new(
        store,
        reqwest::Client::new(),
        &OAuthConfig::default(),
        clock.clone(),
        RetryPolicy::default(),
    ));
    let config = ApiConfig {
        base_url: server.uri(),
        ..ApiConfig::default()
    };
    let client = GitHubClient::new(&config, reqwest::Client::new(), auth, clock).unwrap();

    let err = client.get("/user", None).await.unwrap_err();
    assert!(err.is_authentication_required());
}
