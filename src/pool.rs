//! Per-account reuse of authenticated connections.
//!
//! Each account has at most one cached connection. A cached connection is
//! handed out again while it is connected, authenticated and younger than
//! the maximum age; otherwise it is closed and replaced by a fresh
//! connect + login. Lookups and replacements run under one async mutex,
//! so concurrent callers for the same account never open two links.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionConfig, ConnectionStatus};
use crate::control::Session;
use crate::error::{BlazeError, Result};
use crate::provider::AccountProvider;
use crate::transport::{Connector, TlsConnector};

/// Default maximum age of a pooled connection.
pub const DEFAULT_MAX_CONNECTION_AGE: Duration = Duration::from_secs(300);

/// Default deadline for the login handshake.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Settings for every connection the pool opens.
    pub connection: ConnectionConfig,
    /// Connections older than this are replaced.
    pub max_age: Duration,
    /// Deadline for obtaining an auth code and logging in.
    pub login_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_age: DEFAULT_MAX_CONNECTION_AGE,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
        }
    }
}

impl PoolConfig {
    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }
}

struct PoolEntry {
    connection: Connection,
    created_at: Instant,
}

/// Diagnostics for one pooled connection.
#[derive(Debug, Clone, Serialize)]
pub struct PoolEntryStatus {
    pub account: u64,
    pub age: Duration,
    pub connection: ConnectionStatus,
}

/// Cache of one authenticated connection per account.
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    accounts: Arc<dyn AccountProvider>,
    entries: Mutex<HashMap<u64, PoolEntry>>,
}

impl ConnectionPool {
    /// Pool that dials over TLS.
    pub fn new(config: PoolConfig, accounts: Arc<dyn AccountProvider>) -> Self {
        Self::with_connector(config, accounts, Arc::new(TlsConnector))
    }

    /// Pool that dials through `connector`.
    pub fn with_connector(
        config: PoolConfig,
        accounts: Arc<dyn AccountProvider>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            connector,
            accounts,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The cached connection for `account`, or a freshly authenticated one.
    ///
    /// Returns `None` if connecting or logging in fails; the failure is
    /// logged and nothing is cached.
    pub async fn get_or_create(&self, account: u64) -> Option<Connection> {
        let mut entries = self.entries.lock().await;

        if let Some(entry) = entries.get(&account) {
            let conn = &entry.connection;
            if conn.authenticated() && conn.connected() {
                let age = entry.created_at.elapsed();
                if age < self.config.max_age {
                    tracing::debug!(account, ?age, "Reusing Blaze connection");
                    return Some(conn.clone());
                }
                tracing::debug!(account, ?age, "Blaze connection expired, reconnecting");
            } else {
                tracing::debug!(account, state = ?conn.state(), "Blaze connection unusable, reconnecting");
            }
            if let Some(stale) = entries.remove(&account) {
                stale.connection.close().await;
            }
        }

        match self.create(account).await {
            Ok(connection) => {
                entries.insert(
                    account,
                    PoolEntry {
                        connection: connection.clone(),
                        created_at: Instant::now(),
                    },
                );
                Some(connection)
            }
            Err(e) => {
                tracing::error!(account, "Failed to create Blaze connection: {}", e);
                None
            }
        }
    }

    async fn create(&self, account: u64) -> Result<Connection> {
        let connection =
            Connection::connect_with(self.config.connection.clone(), self.connector.clone())
                .await?;

        match self.login(&connection, account).await {
            Ok(session) => {
                tracing::debug!(account, persona_id = session.persona_id, "Pooled new Blaze connection");
                Ok(connection)
            }
            Err(e) => {
                connection.close().await;
                Err(e)
            }
        }
    }

    async fn login(&self, connection: &Connection, account: u64) -> Result<Session> {
        let timeout = self.config.login_timeout;
        let auth_code = tokio::time::timeout(timeout, self.accounts.auth_code(account))
            .await
            .map_err(|_| {
                BlazeError::Authentication(format!("Timed out fetching auth code after {timeout:?}"))
            })??;
        connection.authenticate(&auth_code, timeout).await
    }

    /// Close and forget every connection. Meant for shutdown.
    pub async fn close_all(&self) {
        let drained: Vec<PoolEntry> = {
            let mut entries = self.entries.lock().await;
            entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.connection.close().await;
        }
        tracing::info!(count, "All Blaze connections closed");
    }

    /// Diagnostics for every cached connection.
    pub async fn status(&self) -> Vec<PoolEntryStatus> {
        let entries = self.entries.lock().await;
        let mut status: Vec<_> = entries
            .iter()
            .map(|(account, entry)| PoolEntryStatus {
                account: *account,
                age: entry.created_at.elapsed(),
                connection: entry.connection.get_connection_status(),
            })
            .collect();
        status.sort_by_key(|s| s.account);
        status
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionState;
    use crate::protocol::{methods, Body, Packet, PacketKind};
    use crate::provider::BoxFuture;
    use crate::testing::{blaze_responder, FakeConnector, Responder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Accounts {
        issued: AtomicUsize,
        fail: bool,
    }

    impl Accounts {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                issued: AtomicUsize::new(0),
                fail,
            })
        }
    }

    impl AccountProvider for Accounts {
        fn auth_code(&self, account: u64) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move {
                self.issued.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    return Err(BlazeError::Authentication("no web session".into()));
                }
                Ok(format!("code-{account}"))
            })
        }
    }

    fn pool(connector: Arc<FakeConnector>, accounts: Arc<Accounts>) -> ConnectionPool {
        let config = PoolConfig::default()
            .with_connection(ConnectionConfig::new("blaze.test", 10539).without_keepalive());
        ConnectionPool::with_connector(config, accounts, connector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_connection_within_max_age() {
        let connector = FakeConnector::new(blaze_responder());
        let pool = pool(connector.clone(), Accounts::new(false));

        let first = pool.get_or_create(1).await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = pool.get_or_create(1).await.unwrap();

        assert!(first.ptr_eq(&second));
        assert!(second.authenticated());
        assert_eq!(connector.dials(), 1);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaces_connection_after_max_age() {
        let connector = FakeConnector::new(blaze_responder());
        let pool = pool(connector.clone(), Accounts::new(false));

        let first = pool.get_or_create(1).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        let second = pool.get_or_create(1).await.unwrap();

        assert!(!first.ptr_eq(&second));
        assert_eq!(first.state(), ConnectionState::Closed);
        assert_eq!(connector.dials(), 2);
        assert_eq!(pool.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaces_unauthenticated_connection() {
        let connector = FakeConnector::new(blaze_responder());
        let pool = pool(connector.clone(), Accounts::new(false));

        let first = pool.get_or_create(1).await.unwrap();
        first.mark_unauthenticated();
        let second = pool.get_or_create(1).await.unwrap();

        assert!(!first.ptr_eq(&second));
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accounts_are_pooled_separately() {
        let connector = FakeConnector::new(blaze_responder());
        let accounts = Accounts::new(false);
        let pool = pool(connector.clone(), accounts.clone());

        let a = pool.get_or_create(1).await.unwrap();
        let b = pool.get_or_create(2).await.unwrap();
        assert!(!a.ptr_eq(&b));
        assert_eq!(accounts.issued.load(Ordering::SeqCst), 2);

        let status = pool.status().await;
        assert_eq!(status.iter().map(|s| s.account).collect::<Vec<_>>(), vec![1, 2]);
        assert!(status.iter().all(|s| s.connection.authenticated));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_login_returns_none() {
        let responder: Responder = Arc::new(|request: &Packet| {
            let fields = if request.method == methods::LOGIN {
                crate::protocol::body([("DSNM", serde_json::json!("only a name"))])
            } else {
                Body::new()
            };
            Some(Packet::reply_to(request, PacketKind::Result, fields))
        });
        let pool = pool(FakeConnector::new(responder), Accounts::new(false));

        assert!(pool.get_or_create(1).await.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_login_times_out() {
        let responder: Responder = Arc::new(|_: &Packet| None);
        let pool = pool(FakeConnector::new(responder), Accounts::new(false));

        assert!(pool.get_or_create(1).await.is_none());
        assert!(pool.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_connect_and_missing_auth_code() {
        let connector = FakeConnector::new(blaze_responder());
        connector.set_refuse(true);
        let refused = pool(connector, Accounts::new(false));
        assert!(refused.get_or_create(1).await.is_none());

        let no_code = pool(FakeConnector::new(blaze_responder()), Accounts::new(true));
        assert!(no_code.get_or_create(1).await.is_none());
        assert!(no_code.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_all_closes_every_connection() {
        let pool = pool(FakeConnector::new(blaze_responder()), Accounts::new(false));
        let a = pool.get_or_create(1).await.unwrap();
        let b = pool.get_or_create(2).await.unwrap();

        pool.close_all().await;

        assert!(pool.is_empty().await);
        assert_eq!(a.state(), ConnectionState::Closed);
        assert_eq!(b.state(), ConnectionState::Closed);
    }
}
