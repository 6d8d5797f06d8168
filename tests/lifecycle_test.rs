mod common;

use common::{Call, add_account, env, env_with_config, eventually, jid};
use std::collections::HashSet;
use std::time::Duration;
use xmpp_rust::config::RuntimeConfig;
use xmpp_rust::session::{
    AuthErrorKind, CSI_FEATURE, ConnectedKind, ConnectionState, SessionEvent,
};
use xmpp_rust::types::account::CertificateIdentity;
use xmpp_rust::types::events::FailureKind;

fn csi_features() -> SessionEvent {
    SessionEvent::ServerFeatures(HashSet::from([CSI_FEATURE.to_string()]))
}

fn test_certificate() -> CertificateIdentity {
    CertificateIdentity {
        subject: "CN=evil.example.com".to_string(),
        issuer: "CN=Unknown CA".to_string(),
        fingerprint_sha1: "aa:bb:cc".to_string(),
        fingerprint_sha256: "dd:ee:ff".to_string(),
    }
}

#[tokio::test]
async fn test_connect_gating() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    // Unknown account: no attempt.
    assert!(!env.manager.connect(&jid("nobody@example.com")).await);

    // First connect goes through, second is gated by the connecting state.
    assert!(env.manager.connect(&alice).await);
    assert!(!env.manager.connect(&alice).await);
    assert_eq!(
        env.manager.connection_state(&alice).await,
        Some(ConnectionState::Connecting)
    );

    // Inactive accounts never connect.
    let carol = add_account(&env, "carol@example.com").await;
    env.accounts.set_active(&carol, false).await.unwrap();
    assert!(!env.manager.connect(&carol).await);
}

#[tokio::test]
async fn test_retry_counter_increments_and_resets_on_establishment() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    let session = env.factory.session(&alice);

    env.factory
        .emit(&alice, SessionEvent::Disconnected { reason: None, redirect: None })
        .await;
    eventually("retry counter reaches 1", || async {
        env.manager.retry_count(&alice).await == 1
    })
    .await;

    env.factory
        .emit(&alice, SessionEvent::Disconnected { reason: None, redirect: None })
        .await;
    eventually("retry counter reaches 2", || async {
        env.manager.retry_count(&alice).await == 2
    })
    .await;

    // Each disconnect triggered an immediate reconnect attempt.
    eventually("three login attempts", || async { session.login_count() == 3 }).await;

    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("counter reset after establishment", || async {
        env.manager.retry_count(&alice).await == 0
    })
    .await;
    assert_eq!(
        env.manager.connection_state(&alice).await,
        Some(ConnectionState::Connected(ConnectedKind::Established))
    );
}

#[tokio::test]
async fn test_certificate_error_deactivates_and_persists_identity() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    let mut failures = env.bus.account_failure.subscribe();

    assert!(env.manager.connect(&alice).await);
    env.factory
        .emit(&alice, SessionEvent::CertificateError(test_certificate()))
        .await;

    eventually("account deactivated", || async {
        !env.accounts.get(&alice).await.unwrap().unwrap().active
    })
    .await;

    let account = env.accounts.get(&alice).await.unwrap().unwrap();
    assert_eq!(account.server_certificate, Some(test_certificate()));

    let failure = failures.recv().await.unwrap();
    assert!(matches!(&failure.kind, FailureKind::Certificate(c) if c == &test_certificate()));

    // Session is gone and will not auto-reconnect.
    eventually("session torn down", || async {
        env.manager.connection_state(&alice).await.is_none()
    })
    .await;

    // Explicit reactivation makes it connectable again.
    env.accounts.set_active(&alice, true).await.unwrap();
    assert!(env.manager.connect(&alice).await);
}

#[tokio::test]
async fn test_transient_auth_failure_keeps_account_active() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    env.factory
        .emit(&alice, SessionEvent::AuthFailed(AuthErrorKind::Aborted))
        .await;
    env.factory
        .emit(
            &alice,
            SessionEvent::AuthFailed(AuthErrorKind::TemporaryAuthFailure),
        )
        .await;

    // Still active, still registered: the engine's follow-up disconnect
    // will drive the retry.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(env.accounts.get(&alice).await.unwrap().unwrap().active);
    assert!(env.manager.connection_state(&alice).await.is_some());
}

#[tokio::test]
async fn test_fatal_auth_failure_deactivates() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    let mut failures = env.bus.account_failure.subscribe();

    assert!(env.manager.connect(&alice).await);
    env.factory
        .emit(&alice, SessionEvent::AuthFailed(AuthErrorKind::NotAuthorized))
        .await;

    eventually("account deactivated", || async {
        !env.accounts.get(&alice).await.unwrap().unwrap().active
    })
    .await;
    let failure = failures.recv().await.unwrap();
    assert!(matches!(
        failure.kind,
        FailureKind::Auth(AuthErrorKind::NotAuthorized)
    ));
    eventually("session torn down", || async {
        env.manager.connection_state(&alice).await.is_none()
    })
    .await;
}

#[tokio::test]
async fn test_redirect_hint_is_persisted_and_applied() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    let session = env.factory.session(&alice);

    env.factory
        .emit(
            &alice,
            SessionEvent::Disconnected {
                reason: Some("see-other-host".to_string()),
                redirect: Some("alt.example.com:5223".to_string()),
            },
        )
        .await;

    eventually("redirect persisted", || async {
        env.accounts.get(&alice).await.unwrap().unwrap().last_endpoint
            == Some("alt.example.com:5223".to_string())
    })
    .await;

    // The automatic reconnect after the disconnect picks up the hint.
    eventually("second login applies endpoint", || async {
        session.has_call(&Call::Login {
            resource: RuntimeConfig::default().device_name,
            endpoint: Some("alt.example.com:5223".to_string()),
        })
    })
    .await;
}

#[tokio::test]
async fn test_network_loss_force_disconnects_all() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    let carol = add_account(&env, "carol@example.com").await;

    assert!(env.manager.connect(&alice).await);
    assert!(env.manager.connect(&carol).await);
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    env.factory.emit(&carol, SessionEvent::SessionEstablished).await;
    eventually("both connected", || async {
        env.manager.connection_state(&alice).await
            == Some(ConnectionState::Connected(ConnectedKind::Established))
            && env.manager.connection_state(&carol).await
                == Some(ConnectionState::Connected(ConnectedKind::Established))
    })
    .await;

    env.manager.network_changed(false).await;
    assert!(env.factory.session(&alice).has_call(&Call::Disconnect { force: true }));
    assert!(env.factory.session(&carol).has_call(&Call::Disconnect { force: true }));

    // While unreachable, no reconnect attempt is made after the engine
    // acknowledges the disconnect.
    let logins_before = env.factory.session(&alice).login_count();
    env.factory
        .emit(&alice, SessionEvent::Disconnected { reason: None, redirect: None })
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.factory.session(&alice).login_count(), logins_before);

    // Connectivity back in the foreground: a connect sweep runs.
    env.manager.network_changed(true).await;
    eventually("reconnect sweep after network regained", || async {
        env.factory.session(&alice).login_count() > logins_before
    })
    .await;
}

#[tokio::test]
async fn test_foreground_resends_presence_and_resets_retries() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    env.factory.emit(&alice, csi_features()).await;
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("connected", || async {
        env.manager
            .connection_state(&alice)
            .await
            .is_some_and(|s| s.is_connected())
    })
    .await;

    let session = env.factory.session(&alice);
    // Establishment applied the foreground client state.
    eventually("active CSI on establishment", || async {
        session.has_call(&Call::ClientState(true))
    })
    .await;

    env.manager.app_foregrounded().await;
    assert!(session.has_call(&Call::Presence));
}

#[tokio::test]
async fn test_background_budget_disconnects_leftover_sessions() {
    let mut config = RuntimeConfig::default();
    config.background_keepalive_budget = Duration::from_millis(80);
    config.budget_safety_margin = Duration::from_millis(10);
    let env = env_with_config(config).await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    env.factory.emit(&alice, csi_features()).await;
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("connected", || async {
        env.manager
            .connection_state(&alice)
            .await
            .is_some_and(|s| s.is_connected())
    })
    .await;

    env.manager.app_backgrounded(Duration::from_secs(30)).await;
    let session = env.factory.session(&alice);
    // Going background sets the idle indication, then the budget expires
    // and the session is force-disconnected.
    assert!(session.has_call(&Call::ClientState(false)));
    eventually("force disconnect after budget", || async {
        session.has_call(&Call::Disconnect { force: true })
    })
    .await;
}

#[tokio::test]
async fn test_foreground_cancels_background_timer() {
    let mut config = RuntimeConfig::default();
    config.background_keepalive_budget = Duration::from_millis(80);
    config.budget_safety_margin = Duration::from_millis(10);
    let env = env_with_config(config).await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("connected", || async {
        env.manager
            .connection_state(&alice)
            .await
            .is_some_and(|s| s.is_connected())
    })
    .await;

    env.manager.app_backgrounded(Duration::from_secs(30)).await;
    env.manager.app_foregrounded().await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    let session = env.factory.session(&alice);
    assert!(!session.has_call(&Call::Disconnect { force: true }));
}

#[tokio::test]
async fn test_account_deactivation_tears_down_session() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    assert!(env.manager.connect(&alice).await);
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("connected", || async {
        env.manager
            .connection_state(&alice)
            .await
            .is_some_and(|s| s.is_connected())
    })
    .await;

    env.accounts.set_active(&alice, false).await.unwrap();
    env.manager.account_changed(&alice).await;

    assert!(env.factory.session(&alice).has_call(&Call::Disconnect { force: false }));
    eventually("session removed", || async {
        env.manager.connection_state(&alice).await.is_none()
    })
    .await;
}
