#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use xmpp_rust::config::RuntimeConfig;
use xmpp_rust::manager::SessionManager;
use xmpp_rust::session::{ProtocolSession, SessionConfig, SessionEvent, SessionFactory};
use xmpp_rust::store::{AccountStore, ChatStore, Database, MessageStore};
use xmpp_rust::types::account::Account;
use xmpp_rust::types::events::EventBus;
use xmpp_rust::types::jid::BareJid;

/// A call recorded by the mock protocol session.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Login {
        resource: String,
        endpoint: Option<String>,
    },
    Disconnect {
        force: bool,
    },
    Keepalive,
    Presence,
    ClientState(bool),
}

/// A protocol session that records calls and emits nothing on its own; tests
/// drive the event stream through the factory.
#[derive(Default)]
pub struct MockSession {
    calls: Mutex<Vec<Call>>,
}

impl MockSession {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn login_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Login { .. }))
            .count()
    }

    pub fn has_call(&self, call: &Call) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProtocolSession for MockSession {
    async fn login(&self, config: SessionConfig) -> Result<(), anyhow::Error> {
        self.record(Call::Login {
            resource: config.resource,
            endpoint: config.endpoint,
        });
        Ok(())
    }

    async fn disconnect(&self, force: bool) {
        self.record(Call::Disconnect { force });
    }

    async fn keepalive(&self) {
        self.record(Call::Keepalive);
    }

    async fn send_presence(&self) {
        self.record(Call::Presence);
    }

    async fn set_client_state(&self, active: bool) {
        self.record(Call::ClientState(active));
    }
}

struct MockHandle {
    session: Arc<MockSession>,
    events: mpsc::Sender<SessionEvent>,
}

/// Factory handing out mock sessions and keeping the event senders around so
/// tests can emit engine events for any account.
#[derive(Default)]
pub struct MockFactory {
    handles: Mutex<HashMap<BareJid, MockHandle>>,
}

impl MockFactory {
    pub fn session(&self, jid: &BareJid) -> Arc<MockSession> {
        self.handles
            .lock()
            .unwrap()
            .get(jid)
            .expect("no session created for this account")
            .session
            .clone()
    }

    pub async fn emit(&self, jid: &BareJid, event: SessionEvent) {
        let sender = self
            .handles
            .lock()
            .unwrap()
            .get(jid)
            .expect("no session created for this account")
            .events
            .clone();
        sender.send(event).await.expect("event pump is gone");
    }
}

#[async_trait]
impl SessionFactory for MockFactory {
    async fn create_session(
        &self,
        account: &Account,
    ) -> Result<(Arc<dyn ProtocolSession>, mpsc::Receiver<SessionEvent>), anyhow::Error> {
        let (tx, rx) = mpsc::channel(16);
        let session = Arc::new(MockSession::default());
        self.handles.lock().unwrap().insert(
            account.jid.clone(),
            MockHandle {
                session: session.clone(),
                events: tx,
            },
        );
        Ok((session, rx))
    }
}

pub struct TestEnv {
    pub db: Database,
    pub bus: Arc<EventBus>,
    pub accounts: Arc<AccountStore>,
    pub chats: Arc<ChatStore>,
    pub history: Arc<MessageStore>,
    pub factory: Arc<MockFactory>,
    pub manager: Arc<SessionManager>,
}

pub async fn env() -> TestEnv {
    env_at(":memory:", RuntimeConfig::default()).await
}

pub async fn env_with_config(config: RuntimeConfig) -> TestEnv {
    env_at(":memory:", config).await
}

pub async fn env_at(path: &str, config: RuntimeConfig) -> TestEnv {
    let _ = env_logger::builder().is_test(true).try_init();

    let db = Database::open(path).await.expect("database open");
    let bus = Arc::new(EventBus::new());
    let accounts = Arc::new(AccountStore::new(db.clone(), bus.clone()));
    let chats = Arc::new(ChatStore::new(db.clone(), bus.clone()));
    let history = Arc::new(MessageStore::new(db.clone(), bus.clone(), config.clone()));
    let factory = Arc::new(MockFactory::default());
    let manager = SessionManager::new(
        accounts.clone(),
        chats.clone(),
        factory.clone(),
        bus.clone(),
        config,
    );
    TestEnv {
        db,
        bus,
        accounts,
        chats,
        history,
        factory,
        manager,
    }
}

pub fn jid(s: &str) -> BareJid {
    s.parse().expect("test jid")
}

pub async fn add_account(env: &TestEnv, s: &str) -> BareJid {
    let jid = jid(s);
    env.accounts
        .upsert(&Account::new(jid.clone(), "secret"))
        .await
        .expect("account upsert");
    jid
}

/// Polls an async condition until it holds or a 2s deadline passes.
pub async fn eventually<F, Fut>(what: &str, condition: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}
