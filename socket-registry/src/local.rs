use dashmap::DashMap;

use crate::{ConnectionHandle, SocketId};

/// Connections accepted by this process, keyed by socket id.
///
/// Registration, removal and relay lookups race each other freely; a miss
/// is the normal outcome for sockets owned by another instance.
#[derive(Default)]
pub struct LocalConnections {
    sockets: DashMap<SocketId, ConnectionHandle>,
}

impl LocalConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the handle for `socket_id`.
    pub fn register(&self, socket_id: SocketId, handle: ConnectionHandle) {
        self.sockets.insert(socket_id, handle);
    }

    pub fn lookup(&self, socket_id: &SocketId) -> Option<ConnectionHandle> {
        self.sockets.get(socket_id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, socket_id: &SocketId) -> Option<ConnectionHandle> {
        self.sockets.remove(socket_id).map(|(_, handle)| handle)
    }

    pub fn contains(&self, socket_id: &SocketId) -> bool {
        self.sockets.contains_key(socket_id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

impl std::fmt::Debug for LocalConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalConnections")
            .field("count", &self.sockets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChannelConnection;
    use std::sync::Arc;

    #[test]
    fn test_register_lookup_remove() {
        let table = LocalConnections::new();
        let id = SocketId::new();
        let (conn, _rx) = ChannelConnection::new(id);

        assert!(table.lookup(&id).is_none());
        table.register(id, conn);
        assert!(table.contains(&id));
        assert_eq!(table.lookup(&id).map(|c| c.id()), Some(id));

        assert!(table.remove(&id).is_some());
        assert!(table.remove(&id).is_none());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_registration_and_removal() {
        let table = Arc::new(LocalConnections::new());
        let ids: Vec<SocketId> = (0..64).map(|_| SocketId::new()).collect();

        let mut handles = Vec::new();
        for id in ids.clone() {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                let (conn, _rx) = ChannelConnection::new(id);
                table.register(id, conn);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.len(), 64);

        let mut handles = Vec::new();
        for id in ids.iter().step_by(2).copied() {
            let table = table.clone();
            handles.push(tokio::spawn(async move {
                table.remove(&id);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(table.len(), 32);
    }
}
