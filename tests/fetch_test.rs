mod common;

use common::{Call, add_account, env, eventually, jid};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use xmpp_rust::fetch::FetchOutcome;
use xmpp_rust::session::SessionEvent;
use xmpp_rust::types::account::Account;

#[tokio::test]
async fn test_fetch_in_foreground_is_nodata() {
    let env = env().await;
    add_account(&env, "alice@example.com").await;

    let outcome = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    assert_eq!(outcome, FetchOutcome::NoData);
}

#[tokio::test]
async fn test_fetch_without_network_fails() {
    let env = env().await;
    add_account(&env, "alice@example.com").await;
    env.manager.app_backgrounded(Duration::from_secs(600)).await;
    env.manager.network_changed(false).await;

    let outcome = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    assert_eq!(outcome, FetchOutcome::Failed);
}

#[tokio::test]
async fn test_fetch_skips_push_accounts() {
    let env = env().await;
    let alice = jid("alice@example.com");
    let mut account = Account::new(alice.clone(), "secret");
    account.push_enabled = true;
    env.accounts.upsert(&account).await.unwrap();

    env.manager.app_backgrounded(Duration::from_secs(600)).await;
    let outcome = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    // Nothing to do: the push channel covers this account.
    assert_eq!(outcome, FetchOutcome::NoData);
    assert!(env.manager.connection_state(&alice).await.is_none());
}

#[tokio::test]
async fn test_fetch_waits_for_establishment() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    env.manager.app_backgrounded(Duration::from_secs(600)).await;

    let manager = env.manager.clone();
    let fetch = tokio::spawn(async move {
        manager.perform_fetch(Arc::new(Notify::new())).await
    });

    eventually("connect attempt submitted", || async {
        env.manager.connection_state(&alice).await.is_some()
    })
    .await;
    assert!(!fetch.is_finished());

    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    let outcome = fetch.await.unwrap();
    assert_eq!(outcome, FetchOutcome::NewData);
}

#[tokio::test]
async fn test_fetch_satisfied_by_stream_resumption() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    env.manager.app_backgrounded(Duration::from_secs(600)).await;

    let manager = env.manager.clone();
    let fetch = tokio::spawn(async move {
        manager.perform_fetch(Arc::new(Notify::new())).await
    });

    eventually("connect attempt submitted", || async {
        env.manager.connection_state(&alice).await.is_some()
    })
    .await;
    env.factory.emit(&alice, SessionEvent::StreamResumed).await;
    assert_eq!(fetch.await.unwrap(), FetchOutcome::NewData);
}

#[tokio::test]
async fn test_second_fetch_while_in_flight_is_rejected() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    env.manager.app_backgrounded(Duration::from_secs(600)).await;

    let manager = env.manager.clone();
    let first = tokio::spawn(async move {
        manager.perform_fetch(Arc::new(Notify::new())).await
    });

    eventually("first fetch is waiting", || async {
        env.manager.connection_state(&alice).await.is_some()
    })
    .await;

    let second = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    assert_eq!(second, FetchOutcome::Busy);

    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    assert_eq!(first.await.unwrap(), FetchOutcome::NewData);

    // After completion a new cycle may start again.
    let third = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    // Alice is connected now; the cycle pings her and completes.
    assert_eq!(third, FetchOutcome::NewData);
    assert!(env.factory.session(&alice).has_call(&Call::Keepalive));
}

#[tokio::test]
async fn test_fetch_expiry_force_disconnects_waited_accounts() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;
    env.manager.app_backgrounded(Duration::from_secs(600)).await;

    let expiry = Arc::new(Notify::new());
    let manager = env.manager.clone();
    let expiry_clone = expiry.clone();
    let fetch = tokio::spawn(async move { manager.perform_fetch(expiry_clone).await });

    eventually("connect attempt submitted", || async {
        env.manager.connection_state(&alice).await.is_some()
    })
    .await;

    expiry.notify_one();
    assert_eq!(fetch.await.unwrap(), FetchOutcome::Failed);
    assert!(env.factory.session(&alice).has_call(&Call::Disconnect { force: true }));

    // A late establishment event after expiry must not panic or revive the
    // wait: the removal is idempotent.
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_fetch_pings_connected_accounts() {
    let env = env().await;
    let alice = add_account(&env, "alice@example.com").await;

    // Connect and establish while still foregrounded.
    assert!(env.manager.connect(&alice).await);
    env.factory.emit(&alice, SessionEvent::SessionEstablished).await;
    eventually("connected", || async {
        env.manager
            .connection_state(&alice)
            .await
            .is_some_and(|s| s.is_connected())
    })
    .await;

    env.manager.app_backgrounded(Duration::from_secs(600)).await;
    let outcome = env.manager.perform_fetch(Arc::new(Notify::new())).await;
    assert_eq!(outcome, FetchOutcome::NewData);
    assert!(env.factory.session(&alice).has_call(&Call::Keepalive));
}
