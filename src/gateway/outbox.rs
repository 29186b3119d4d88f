use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::presence::ConnectionId;

use super::events::ServerEvent;

/// Per-connection outbound queues.
///
/// Each connection drains its own queue on its own task, so a stalled socket
/// only backs up its own queue and a send never waits on a receiver.
#[derive(Clone, Default)]
pub struct Outbox {
    senders: Arc<Mutex<HashMap<ConnectionId, UnboundedSender<ServerEvent>>>>,
}

impl Outbox {
    pub fn register(&self, id: ConnectionId) -> UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().insert(id, tx);
        rx
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.senders.lock().remove(&id);
    }

    /// False when the connection is gone; the event is dropped.
    pub fn send(&self, id: ConnectionId, event: ServerEvent) -> bool {
        let senders = self.senders.lock();
        let Some(tx) = senders.get(&id) else {
            tracing::debug!(conn_id = %id, event = event.name(), "no outbox for connection");
            return false;
        };
        tx.send(event).is_ok()
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
