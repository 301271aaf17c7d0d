use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Live state of one accepted TCP connection
#[derive(Clone, Debug)]
pub struct ConnectionInfo {
    pub peer: SocketAddr,
    pub opened_at: Instant,
    pub last_activity: Instant,
    pub bytes_received: u64,
}

#[derive(Default)]
struct RegistryInner {
    next_id: u64,
    connections: HashMap<u64, ConnectionInfo>,
    rejected: u64,
}

/// Registry of live TCP connections with admission control.
///
/// Slots are handed out as [`ConnectionGuard`]s; dropping the guard is the
/// only way a slot is released, so every exit path of a connection task
/// (clean close, socket error, idle timeout, cancellation, panic) releases
/// it exactly once.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a connection unless `max_connections` are already live
    pub fn try_register(&self, peer: SocketAddr, max_connections: usize) -> Option<ConnectionGuard> {
        let mut inner = self.inner.lock();
        if inner.connections.len() >= max_connections {
            inner.rejected += 1;
            return None;
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let now = Instant::now();
        inner.connections.insert(
            id,
            ConnectionInfo {
                peer,
                opened_at: now,
                last_activity: now,
                bytes_received: 0,
            },
        );

        Some(ConnectionGuard {
            id,
            registry: self.clone(),
        })
    }

    /// Number of live connections
    pub fn active(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Connections refused at the ceiling since creation
    pub fn rejected(&self) -> u64 {
        self.inner.lock().rejected
    }

    pub fn snapshot(&self) -> Vec<(u64, ConnectionInfo)> {
        let mut connections: Vec<_> = self
            .inner
            .lock()
            .connections
            .iter()
            .map(|(id, info)| (*id, info.clone()))
            .collect();
        connections.sort_by_key(|(id, _)| *id);
        connections
    }

    fn touch(&self, id: u64, bytes: usize) {
        if let Some(info) = self.inner.lock().connections.get_mut(&id) {
            info.last_activity = Instant::now();
            info.bytes_received += bytes as u64;
        }
    }

    fn release(&self, id: u64) {
        self.inner.lock().connections.remove(&id);
    }
}

/// Occupied connection slot; released on drop
pub struct ConnectionGuard {
    id: u64,
    registry: ConnectionRegistry,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Record received bytes and refresh the activity timestamp
    pub fn touch(&self, bytes: usize) {
        self.registry.touch(self.id, bytes);
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_admission_ceiling() {
        let registry = ConnectionRegistry::new();
        let guards: Vec<_> = (0..3)
            .map(|i| registry.try_register(peer(1000 + i), 3).unwrap())
            .collect();

        assert!(registry.try_register(peer(2000), 3).is_none());
        assert_eq!(registry.active(), 3);
        assert_eq!(registry.rejected(), 1);

        drop(guards);
        assert_eq!(registry.active(), 0);
        assert!(registry.try_register(peer(2000), 3).is_some());
    }

    #[test]
    fn test_touch_updates_activity() {
        let registry = ConnectionRegistry::new();
        let guard = registry.try_register(peer(1), 10).unwrap();
        guard.touch(128);
        guard.touch(2);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, guard.id());
        assert_eq!(snapshot[0].1.bytes_received, 130);
        assert!(snapshot[0].1.last_activity >= snapshot[0].1.opened_at);
    }

    #[test]
    fn test_release_happens_once_per_guard() {
        let registry = ConnectionRegistry::new();
        let a = registry.try_register(peer(1), 10).unwrap();
        let b = registry.try_register(peer(2), 10).unwrap();
        drop(a);
        assert_eq!(registry.active(), 1);
        drop(b);
        assert_eq!(registry.active(), 0);
    }
}
