use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Error;

/// Process-local identifier of an open connection.
///
/// Stored in the shared store as its hyphenated UUID string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(Uuid);

impl SocketId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SocketId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for SocketId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// A live bidirectional connection owned by this process.
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> SocketId;

    /// False once the peer has gone away; delivery paths skip such sockets.
    fn is_available(&self) -> bool;

    /// Write one text frame to the peer.
    async fn send(&self, text: &str) -> Result<(), Error>;
}

/// Shared handle stored in the local connection table.
pub type ConnectionHandle = Arc<dyn Connection>;

/// Connection backed by an unbounded channel whose receiver is drained by
/// the task that owns the actual socket sink.
pub struct ChannelConnection {
    id: SocketId,
    tx: mpsc::UnboundedSender<String>,
    open: AtomicBool,
}

impl ChannelConnection {
    pub fn new(id: SocketId) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id,
            tx,
            open: AtomicBool::new(true),
        });
        (conn, rx)
    }

    /// Mark the connection closed; later sends are skipped or rejected.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn id(&self) -> SocketId {
        self.id
    }

    fn is_available(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    async fn send(&self, text: &str) -> Result<(), Error> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::Send(format!("socket {} is closed", self.id)));
        }
        self.tx
            .send(text.to_string())
            .map_err(|_| Error::Send(format!("socket {} writer has gone away", self.id)))
    }
}
