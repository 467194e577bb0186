//! Connection registry
//!
//! Maps connection IDs to the lifecycle state of one logical connection. On the
//! relay a `Pending` entry also holds the waiter that receives the agent's
//! matching physical connection; `P` is the type handed to that waiter.
//!
//! Every entry owns a cancellation token. Cancelling it stops the relay loop
//! running for that connection, which then removes the entry itself. Entries
//! may carry the ID of the session that created them; only that session can
//! disconnect them through [`disconnect_owned`](ConnectionRegistry::disconnect_owned).

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection id {0} is already registered")]
    Conflict(String),
}

/// Lifecycle of a logical connection while it is registered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for the agent's physical connection
    Pending,
    /// Both sockets bound, relay loop running
    Open,
    /// A disconnect request has been sent or received
    Closing,
}

struct Entry<P> {
    state: ConnectionState,
    owner: Option<u64>,
    waiter: Option<oneshot::Sender<P>>,
    shutdown: CancellationToken,
    created_at: Instant,
}

pub struct ConnectionRegistry<P> {
    entries: Arc<DashMap<String, Entry<P>>>,
}

impl<P> Clone for ConnectionRegistry<P> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<P> Default for ConnectionRegistry<P> {
    fn default() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<P> std::fmt::Debug for ConnectionRegistry<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.entries.len())
            .finish()
    }
}

impl<P> ConnectionRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection that waits for its peer connection
    ///
    /// The returned receiver resolves when [`fulfill`](Self::fulfill) is called
    /// with the same ID.
    pub fn register_pending(
        &self,
        connection_id: &str,
        shutdown: CancellationToken,
    ) -> Result<oneshot::Receiver<P>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.insert(connection_id, ConnectionState::Pending, None, Some(tx), shutdown)?;
        Ok(rx)
    }

    /// [`register_pending`](Self::register_pending) for a connection owned by session `owner`
    pub fn register_pending_owned(
        &self,
        owner: u64,
        connection_id: &str,
        shutdown: CancellationToken,
    ) -> Result<oneshot::Receiver<P>, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.insert(
            connection_id,
            ConnectionState::Pending,
            Some(owner),
            Some(tx),
            shutdown,
        )?;
        Ok(rx)
    }

    /// Register a connection whose sockets are already bound
    pub fn register_open(
        &self,
        connection_id: &str,
        shutdown: CancellationToken,
    ) -> Result<(), RegistryError> {
        self.insert(connection_id, ConnectionState::Open, None, None, shutdown)
    }

    fn insert(
        &self,
        connection_id: &str,
        state: ConnectionState,
        owner: Option<u64>,
        waiter: Option<oneshot::Sender<P>>,
        shutdown: CancellationToken,
    ) -> Result<(), RegistryError> {
        match self.entries.entry(connection_id.to_string()) {
            MapEntry::Occupied(_) => {
                warn!(connection_id = %connection_id, "Connection id collision");
                Err(RegistryError::Conflict(connection_id.to_string()))
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry {
                    state,
                    owner,
                    waiter,
                    shutdown,
                    created_at: Instant::now(),
                });
                debug!(connection_id = %connection_id, ?state, "Connection registered");
                Ok(())
            }
        }
    }

    /// Hand `value` to the waiter of a pending connection and mark it open
    ///
    /// Gives the value back if the ID is unknown, not pending, or its waiter
    /// has already gone away.
    pub fn fulfill(&self, connection_id: &str, value: P) -> Result<(), P> {
        let waiter = match self.entries.get_mut(connection_id) {
            Some(mut entry) if entry.state == ConnectionState::Pending => {
                entry.state = ConnectionState::Open;
                entry.waiter.take()
            }
            _ => None,
        };

        match waiter {
            Some(tx) => tx.send(value),
            None => Err(value),
        }
    }

    /// Drop a connection that is still pending; open connections are left alone
    pub fn cancel_pending(&self, connection_id: &str) -> bool {
        self.entries
            .remove_if(connection_id, |_, entry| {
                entry.state == ConnectionState::Pending
            })
            .is_some()
    }

    pub fn mark_closing(&self, connection_id: &str) -> bool {
        match self.entries.get_mut(connection_id) {
            Some(mut entry) => {
                entry.state = ConnectionState::Closing;
                true
            }
            None => false,
        }
    }

    /// Ask the relay loop of a connection to disconnect
    pub fn disconnect(&self, connection_id: &str) -> bool {
        let token = self
            .entries
            .get(connection_id)
            .map(|entry| entry.shutdown.clone());

        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Like [`disconnect`](Self::disconnect), but only for a connection owned by `owner`
    ///
    /// Connections of other sessions are treated as unknown.
    pub fn disconnect_owned(&self, owner: u64, connection_id: &str) -> bool {
        let token = self
            .entries
            .get(connection_id)
            .filter(|entry| entry.owner == Some(owner))
            .map(|entry| entry.shutdown.clone());

        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn owner(&self, connection_id: &str) -> Option<u64> {
        self.entries.get(connection_id).and_then(|entry| entry.owner)
    }

    pub fn remove(&self, connection_id: &str) -> bool {
        match self.entries.remove(connection_id) {
            Some((_, entry)) => {
                debug!(
                    connection_id = %connection_id,
                    lifetime_ms = entry.created_at.elapsed().as_millis() as u64,
                    "Connection removed"
                );
                true
            }
            None => false,
        }
    }

    pub fn state(&self, connection_id: &str) -> Option<ConnectionState> {
        self.entries.get(connection_id).map(|entry| entry.state)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.entries.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Disconnect every registered connection
    pub fn shutdown_all(&self) {
        let tokens: Vec<CancellationToken> = self
            .entries
            .iter()
            .map(|entry| entry.shutdown.clone())
            .collect();

        for token in tokens {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pending_fulfill() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        let rx = registry
            .register_pending("c1", CancellationToken::new())
            .unwrap();
        assert_eq!(registry.state("c1"), Some(ConnectionState::Pending));

        assert!(registry.fulfill("c1", 7).is_ok());
        assert_eq!(rx.await.unwrap(), 7);
        assert_eq!(registry.state("c1"), Some(ConnectionState::Open));

        // Already open
        assert_eq!(registry.fulfill("c1", 8), Err(8));
    }

    #[test]
    fn test_fulfill_unknown() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        assert_eq!(registry.fulfill("missing", 1), Err(1));
    }

    #[test]
    fn test_fulfill_dropped_waiter() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        let rx = registry
            .register_pending("c1", CancellationToken::new())
            .unwrap();
        drop(rx);

        assert_eq!(registry.fulfill("c1", 3), Err(3));
    }

    #[test]
    fn test_conflict() {
        let registry: ConnectionRegistry<()> = ConnectionRegistry::new();
        registry
            .register_open("c1", CancellationToken::new())
            .unwrap();

        let result = registry.register_pending("c1", CancellationToken::new());
        assert!(matches!(result, Err(RegistryError::Conflict(ref id)) if id == "c1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_pending_only() {
        let registry: ConnectionRegistry<()> = ConnectionRegistry::new();
        let _rx = registry
            .register_pending("pending", CancellationToken::new())
            .unwrap();
        registry
            .register_open("open", CancellationToken::new())
            .unwrap();

        assert!(registry.cancel_pending("pending"));
        assert!(!registry.cancel_pending("open"));
        assert!(!registry.contains("pending"));
        assert!(registry.contains("open"));
    }

    #[test]
    fn test_disconnect_cancels_token() {
        let registry: ConnectionRegistry<()> = ConnectionRegistry::new();
        let token = CancellationToken::new();
        registry.register_open("c1", token.clone()).unwrap();

        assert!(registry.disconnect("c1"));
        assert!(token.is_cancelled());
        assert!(!registry.disconnect("unknown"));

        // Removal is left to the relay loop
        assert!(registry.contains("c1"));
        assert!(registry.mark_closing("c1"));
        assert_eq!(registry.state("c1"), Some(ConnectionState::Closing));
        assert!(registry.remove("c1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_disconnect_owned_ignores_other_sessions() {
        let registry: ConnectionRegistry<()> = ConnectionRegistry::new();
        let mine = CancellationToken::new();
        let theirs = CancellationToken::new();
        let _a = registry.register_pending_owned(1, "a", mine.clone()).unwrap();
        let _b = registry.register_pending_owned(2, "b", theirs.clone()).unwrap();
        registry
            .register_open("unowned", CancellationToken::new())
            .unwrap();

        assert_eq!(registry.owner("a"), Some(1));
        assert_eq!(registry.owner("unowned"), None);

        assert!(!registry.disconnect_owned(1, "b"));
        assert!(!theirs.is_cancelled());
        assert!(!registry.disconnect_owned(1, "unowned"));
        assert!(!registry.disconnect_owned(1, "missing"));

        assert!(registry.disconnect_owned(1, "a"));
        assert!(mine.is_cancelled());
    }

    #[test]
    fn test_shutdown_all() {
        let registry: ConnectionRegistry<()> = ConnectionRegistry::new();
        let tokens: Vec<_> = (0..3).map(|_| CancellationToken::new()).collect();
        for (i, token) in tokens.iter().enumerate() {
            registry
                .register_open(&format!("c{}", i), token.clone())
                .unwrap();
        }

        registry.shutdown_all();
        assert!(tokens.iter().all(|t| t.is_cancelled()));

        let mut ids = registry.ids();
        ids.sort();
        assert_eq!(ids, vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry: ConnectionRegistry<usize> = ConnectionRegistry::new();
        let mut handles = Vec::new();

        for i in 0..32 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("conn-{}", i);
                let rx = registry
                    .register_pending(&id, CancellationToken::new())
                    .unwrap();
                registry.fulfill(&id, i).unwrap();
                rx.await.unwrap()
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }
        assert_eq!(registry.len(), 32);
    }
}
