//! Shared map of live connections.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use crate::transport::{CloseReason, Connection, ConnectionKey};

/// Closed keys remembered so that late packets are not mistaken for new
/// connections.
pub const CLOSED_KEY_MEMORY: usize = 1024;

/// Notifications emitted by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A peer opened a connection to us.
    Accepted {
        /// Key of the new connection.
        key: ConnectionKey,
    },
    /// A connection was torn down.
    Closed {
        /// Key of the closed connection.
        key: ConnectionKey,
        /// Why it was closed.
        reason: CloseReason,
    },
}

/// Registry of live connections, keyed by `(remote address, recv_id)`.
///
/// The map lock is held only for map operations; callers work on the
/// returned `Arc`s.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionKey, Arc<Connection>>>,
    next_id: Mutex<u16>,
    recently_closed: Mutex<ClosedKeys>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

#[derive(Debug, Default)]
struct ClosedKeys {
    order: VecDeque<ConnectionKey>,
    keys: HashSet<ConnectionKey>,
}

impl ClosedKeys {
    fn remember(&mut self, key: ConnectionKey) {
        if !self.keys.insert(key) {
            return;
        }
        self.order.push_back(key);
        if self.order.len() > CLOSED_KEY_MEMORY {
            if let Some(oldest) = self.order.pop_front() {
                self.keys.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, key: &ConnectionKey) {
        if self.keys.remove(key) {
            self.order.retain(|k| k != key);
        }
    }
}

impl ConnectionRegistry {
    /// Create a registry with a random connection id seed.
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self::with_seed(rand::random(), events)
    }

    /// Create a registry whose id allocator starts at `seed`.
    pub fn with_seed(seed: u16, events: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_id: Mutex::new(seed),
            recently_closed: Mutex::new(ClosedKeys::default()),
            events,
        }
    }

    /// Allocate the next connection id (16-bit wrapping counter).
    pub fn next_connection_id(&self) -> u16 {
        let mut next = self.next_id.lock();
        let id = *next;
        *next = next.wrapping_add(1);
        id
    }

    /// Return the connection for `key`, creating it with `make` if absent.
    ///
    /// The flag is `true` when this call created the entry.
    pub fn get_or_create<F>(&self, key: ConnectionKey, make: F) -> (Arc<Connection>, bool)
    where
        F: FnOnce() -> Connection,
    {
        if let Some(conn) = self.connections.read().get(&key) {
            return (Arc::clone(conn), false);
        }

        let mut connections = self.connections.write();
        if let Some(conn) = connections.get(&key) {
            return (Arc::clone(conn), false);
        }
        let conn = Arc::new(make());
        connections.insert(key, Arc::clone(&conn));
        tracing::debug!("Registered connection {}", key);
        (conn, true)
    }

    /// Register a connection, unless the key is taken.
    ///
    /// Returns `false` (and drops nothing) if an entry already exists.
    pub fn insert(&self, conn: Arc<Connection>) -> bool {
        let key = conn.key();
        let mut connections = self.connections.write();
        if connections.contains_key(&key) {
            return false;
        }
        connections.insert(key, conn);
        tracing::debug!("Registered connection {}", key);
        true
    }

    /// Look up a connection.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.read().get(key).cloned()
    }

    /// Deregister a connection without closing it.
    ///
    /// A later [`get_or_create`](Self::get_or_create) for the same key
    /// builds fresh state.
    pub fn remove(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.write().remove(key)
    }

    /// Stable copy of every registered connection.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().values().cloned().collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    /// `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Tear a connection down: mark it closed, deregister it and emit
    /// [`TransportEvent::Closed`].
    ///
    /// Only the first call for a given connection does anything; the return
    /// value tells whether this call was it.
    pub fn close(&self, conn: &Arc<Connection>, reason: CloseReason) -> bool {
        if !conn.mark_closed() {
            return false;
        }

        let key = conn.key();
        self.recently_closed.lock().remember(key);
        {
            let mut connections = self.connections.write();
            // The key may already belong to a newer connection
            if connections
                .get(&key)
                .is_some_and(|registered| Arc::ptr_eq(registered, conn))
            {
                connections.remove(&key);
            }
        }

        match reason {
            CloseReason::RetriesExhausted | CloseReason::Unavailable => {
                tracing::warn!("Connection {} closed: {}", key, reason);
            }
            _ => tracing::debug!("Connection {} closed: {}", key, reason),
        }
        self.notify(TransportEvent::Closed { key, reason });
        true
    }

    /// `true` if a connection with this key was closed recently.
    pub fn was_closed(&self, key: &ConnectionKey) -> bool {
        self.recently_closed.lock().keys.contains(key)
    }

    /// Allow a closed key to be reused (a fresh SYN for it arrived).
    pub fn forget_closed(&self, key: &ConnectionKey) {
        self.recently_closed.lock().forget(key);
    }

    /// Close every registered connection.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.snapshot()
            .iter()
            .filter(|conn| self.close(conn, reason))
            .count()
    }

    /// Emit an event; dropped silently if nobody listens.
    pub fn notify(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DatagramSink, DecodeError};
    use crate::dispatch::DispatchPool;
    use crate::transport::testing::{RecordingSink, peer_addr};
    use crate::transport::{ConnectionConfig, ConnectionContext};

    fn context() -> ConnectionContext {
        let sink: Arc<dyn DatagramSink> = Arc::new(RecordingSink::new());
        ConnectionContext {
            sink,
            pool: Arc::new(DispatchPool::new(1).unwrap()),
            decoder: Arc::new(|_: Vec<u8>| -> Result<(), DecodeError> { Ok(()) }),
            config: ConnectionConfig::default(),
        }
    }

    fn registry() -> (ConnectionRegistry, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionRegistry::with_seed(65534, tx), rx)
    }

    #[test]
    fn test_id_allocator_wraps() {
        let (registry, _rx) = registry();
        assert_eq!(registry.next_connection_id(), 65534);
        assert_eq!(registry.next_connection_id(), 65535);
        assert_eq!(registry.next_connection_id(), 0);
    }

    #[test]
    fn test_get_or_create() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);

        let (first, created) =
            registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));
        assert!(created);
        let (second, created) = registry.get_or_create(key, || unreachable!());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&key).is_some());
    }

    #[test]
    fn test_insert_refuses_taken_key() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);

        assert!(registry.insert(Arc::new(Connection::outbound(key, ctx.clone()))));
        assert!(!registry.insert(Arc::new(Connection::outbound(key, ctx))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_then_recreate_is_fresh() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);

        let (first, _) = registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));
        let _rx = first.connect().unwrap();
        assert_eq!(first.with_state(|s| s.next_seq()), 2);

        assert!(registry.remove(&key).is_some());
        assert!(registry.get(&key).is_none());

        let (second, created) =
            registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));
        assert!(created);
        assert_eq!(second.with_state(|s| s.next_seq()), 1);
    }

    #[test]
    fn test_close_exactly_once() {
        let (registry, mut rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);
        let (conn, _) = registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));

        assert!(registry.close(&conn, CloseReason::RetriesExhausted));
        assert!(!registry.close(&conn, CloseReason::Local));

        assert!(registry.is_empty());
        assert!(conn.is_closed());
        assert_eq!(
            rx.try_recv().unwrap(),
            TransportEvent::Closed {
                key,
                reason: CloseReason::RetriesExhausted
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_keys_remembered() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);
        let (conn, _) = registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));

        assert!(!registry.was_closed(&key));
        registry.close(&conn, CloseReason::PeerFin);
        assert!(registry.was_closed(&key));
        registry.forget_closed(&key);
        assert!(!registry.was_closed(&key));
    }

    #[test]
    fn test_closed_key_memory_is_bounded() {
        let mut closed = ClosedKeys::default();
        for id in 0..=CLOSED_KEY_MEMORY as u16 {
            closed.remember(ConnectionKey::new(peer_addr(), id));
        }
        assert_eq!(closed.order.len(), CLOSED_KEY_MEMORY);
        assert!(!closed.keys.contains(&ConnectionKey::new(peer_addr(), 0)));
        assert!(closed.keys.contains(&ConnectionKey::new(peer_addr(), 1)));
    }

    #[test]
    fn test_close_keeps_newer_entry() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);

        let (old, _) = registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));
        registry.remove(&key);
        let (new, _) = registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));

        assert!(registry.close(&old, CloseReason::Local));
        let current = registry.get(&key).unwrap();
        assert!(Arc::ptr_eq(&current, &new));
    }

    #[test]
    fn test_close_all() {
        let (registry, mut rx) = registry();
        let ctx = context();
        for id in 0..3 {
            let key = ConnectionKey::new(peer_addr(), id);
            registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));
        }

        assert_eq!(registry.close_all(CloseReason::Shutdown), 3);
        assert!(registry.is_empty());
        let mut closed = 0;
        while let Ok(TransportEvent::Closed { reason, .. }) = rx.try_recv() {
            assert_eq!(reason, CloseReason::Shutdown);
            closed += 1;
        }
        assert_eq!(closed, 3);
    }

    #[test]
    fn test_snapshot_is_detached() {
        let (registry, _rx) = registry();
        let ctx = context();
        let key = ConnectionKey::new(peer_addr(), 5);
        registry.get_or_create(key, || Connection::outbound(key, ctx.clone()));

        let snapshot = registry.snapshot();
        registry.remove(&key);
        assert_eq!(snapshot.len(), 1);
        assert!(registry.is_empty());
    }
}
