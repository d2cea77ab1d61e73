// Integration tests for the refresh scheduler against a mock token endpoint

use chrono::{Duration, Utc};
use mockito::{Matcher, Server};
use postpilot::credentials::{CredentialStore, NewCredential, TokenCipher};
use postpilot::oauth::{redirect_uri_for, ProviderConfig, ProviderRegistry, TokenExchanger};
use postpilot::platform::Platform;
use postpilot::refresh::{RefreshMode, RefreshOutcome, RefreshScheduler, TokenRefresher};
use postpilot::secret::Secret;
use postpilot::Error;
use std::sync::Arc;

fn scheduler_for(token_url: String) -> (Arc<RefreshScheduler>, Arc<CredentialStore>) {
    let registry = Arc::new(ProviderRegistry::new([ProviderConfig {
        platform: Platform::Linkedin,
        name: "LinkedIn".to_string(),
        authorization_url: "https://www.linkedin.com/oauth/v2/authorization".to_string(),
        token_url,
        profile_url: None,
        client_id: "client".to_string(),
        client_secret: Secret::new("client-secret"),
        redirect_uri: redirect_uri_for("http://localhost:3000", Platform::Linkedin),
        scopes: vec!["w_member_social".to_string()],
    }]));
    let cipher = Arc::new(TokenCipher::from_bytes(&[1u8; 32]).unwrap());
    let store = Arc::new(CredentialStore::with_cipher(":memory:", cipher).unwrap());
    let exchanger: Arc<dyn TokenRefresher> =
        Arc::new(TokenExchanger::new(registry, std::time::Duration::from_secs(2)).unwrap());

    let scheduler = Arc::new(RefreshScheduler::new(Arc::clone(&store), exchanger, 300));
    (scheduler, store)
}

fn save_expiring(store: &CredentialStore, refresh_token: &str) {
    store
        .save(&NewCredential {
            user_id: "user1".to_string(),
            platform: Platform::Linkedin,
            access_token: Secret::new("old-access"),
            refresh_token: Some(Secret::new(refresh_token)),
            expires_at: Some(Utc::now() + Duration::minutes(3)),
            scopes: vec!["w_member_social".to_string()],
            account_id: None,
            display_name: None,
            profile_image_url: None,
        })
        .unwrap();
}

#[tokio::test]
async fn test_concurrent_passes_refresh_once() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            Matcher::UrlEncoded("refresh_token".into(), "r1".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"new-access","refresh_token":"r2","expires_in":3600}"#)
        .expect(1)
        .create_async()
        .await;

    let (scheduler, store) = scheduler_for(format!("{}/token", server.url()));
    save_expiring(&store, "r1");

    let first = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move { scheduler.run_pass().await })
    };
    let second = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler
                .refresh_credential("user1", Platform::Linkedin, RefreshMode::IfDue)
                .await
        })
    };

    let report = first.await.unwrap().unwrap();
    let outcome = second.await.unwrap().unwrap();

    mock.assert_async().await;

    // Exactly one of the two did the work
    let refreshed_by_pass = report.refreshed == 1;
    let refreshed_by_call = matches!(outcome, RefreshOutcome::Refreshed { .. });
    assert!(refreshed_by_pass ^ refreshed_by_call);

    let current = store.get("user1", Platform::Linkedin).unwrap();
    assert_eq!(current.tokens.access_token.expose(), "new-access");
    assert_eq!(
        current.tokens.refresh_token.as_ref().map(Secret::expose),
        Some("r2")
    );
    assert_eq!(store.history("user1", Platform::Linkedin).unwrap().len(), 1);
}

#[tokio::test]
async fn test_non_rotating_provider_keeps_refresh_token() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"new-access","expires_in":5184000}"#)
        .create_async()
        .await;

    let (scheduler, store) = scheduler_for(format!("{}/token", server.url()));
    save_expiring(&store, "long-lived");

    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.refreshed, 1);

    let current = store.get("user1", Platform::Linkedin).unwrap();
    assert_eq!(
        current.tokens.refresh_token.as_ref().map(Secret::expose),
        Some("long-lived")
    );
    assert!(current.credential.expires_at.unwrap() > Utc::now() + Duration::days(59));
}

#[tokio::test]
async fn test_server_error_is_retried_next_pass() {
    let mut server = Server::new_async().await;
    let outage = server
        .mock("POST", "/token")
        .with_status(503)
        .with_body("upstream unavailable")
        .expect(1)
        .create_async()
        .await;

    let (scheduler, store) = scheduler_for(format!("{}/token", server.url()));
    save_expiring(&store, "r1");

    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.transient_failures, 1);
    assert_eq!(report.deactivated, 0);
    outage.assert_async().await;
    assert_eq!(store.list_active("user1").unwrap().len(), 1);

    outage.remove_async().await;
    let _recovered = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"new-access","expires_in":3600}"#)
        .create_async()
        .await;

    let report = scheduler.run_pass().await.unwrap();
    assert_eq!(report.refreshed, 1);
}

#[tokio::test]
async fn test_unreachable_provider_is_transient() {
    // Nothing listens on port 9 locally
    let (scheduler, store) = scheduler_for("http://127.0.0.1:9/token".to_string());
    save_expiring(&store, "r1");

    let err = scheduler
        .refresh_credential("user1", Platform::Linkedin, RefreshMode::IfDue)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RefreshFailed { .. }));
    assert!(err.is_transient());
    assert!(store.get("user1", Platform::Linkedin).unwrap().credential.active);
}

#[tokio::test]
async fn test_malformed_success_body_is_terminal() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"token":"leaky-secret"}"#)
        .create_async()
        .await;

    let (scheduler, store) = scheduler_for(format!("{}/token", server.url()));
    save_expiring(&store, "r1");

    let err = scheduler
        .refresh_credential("user1", Platform::Linkedin, RefreshMode::IfDue)
        .await
        .unwrap_err();

    assert!(err.is_terminal());
    assert!(!err.to_string().contains("leaky-secret"));
    assert!(store.list_active("user1").unwrap().is_empty());
}
