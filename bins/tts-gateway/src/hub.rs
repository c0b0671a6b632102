// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-process subscriber fan-out (spec §4.8), grounded on
//! `echo-session-service::HubState`: connections register interest in a
//! `(user, document)` pair, and a publisher looks up the registered senders
//! and forwards a cloned message to each.
//!
//! A single gateway replica is assumed to own all WebSocket connections for
//! the documents it serves; a multi-replica deployment would need a real
//! Redis pub/sub fan-out instead of this in-memory one (see DESIGN.md).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tokio::sync::mpsc::Sender;
use tts_protocol::{DocumentId, ServerMessage, UserId};

/// Opaque identifier for one WebSocket connection.
pub type ConnId = u64;

struct ConnEntry {
    tx: Sender<ServerMessage>,
    subscribed: HashSet<(UserId, DocumentId)>,
}

/// Registry of live WebSocket connections and their per-document
/// subscriptions.
#[derive(Default)]
pub struct Hub {
    next_conn_id: ConnId,
    conns: HashMap<ConnId, ConnEntry>,
    subscribers: HashMap<(UserId, DocumentId), HashSet<ConnId>>,
}

impl Hub {
    /// Register a new connection's outbound sender, returning its id.
    pub fn register(&mut self, tx: Sender<ServerMessage>) -> ConnId {
        let id = self.next_conn_id;
        self.next_conn_id = self.next_conn_id.wrapping_add(1);
        self.conns.insert(
            id,
            ConnEntry {
                tx,
                subscribed: HashSet::new(),
            },
        );
        id
    }

    /// Lazily subscribe a connection to a `(user, document)` pair's
    /// notifications on its first `synthesize` for that document.
    pub fn subscribe(&mut self, conn_id: ConnId, user_id: UserId, document_id: DocumentId) {
        if let Some(conn) = self.conns.get_mut(&conn_id) {
            conn.subscribed.insert((user_id, document_id));
        }
        self.subscribers
            .entry((user_id, document_id))
            .or_default()
            .insert(conn_id);
    }

    /// Remove a connection and its subscriptions on disconnect.
    pub fn remove(&mut self, conn_id: ConnId) {
        let Some(conn) = self.conns.remove(&conn_id) else {
            return;
        };
        for key in conn.subscribed {
            if let Some(subs) = self.subscribers.get_mut(&key) {
                subs.remove(&conn_id);
            }
        }
    }

    /// Forward `message` to every connection subscribed to `(user,
    /// document)`. Dead senders are left for the connection's own cleanup
    /// to remove.
    pub fn publish(&self, user_id: UserId, document_id: DocumentId, message: &ServerMessage) {
        let Some(subs) = self.subscribers.get(&(user_id, document_id)) else {
            return;
        };
        for conn_id in subs {
            if let Some(conn) = self.conns.get(conn_id) {
                let _ = conn.tx.try_send(message.clone());
            }
        }
    }
}

/// Thread-safe handle shared across the WebSocket handler and the Result
/// Consumer / Visibility Scanner background tasks.
pub type SharedHub = std::sync::Arc<Mutex<Hub>>;

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use tts_protocol::BlockStatus;
    use uuid::Uuid;

    #[tokio::test]
    async fn publish_reaches_only_subscribed_connections() {
        let mut hub = Hub::default();
        let (tx_a, mut rx_a) = tokio::sync::mpsc::channel(8);
        let (tx_b, mut rx_b) = tokio::sync::mpsc::channel(8);
        let conn_a = hub.register(tx_a);
        let conn_b = hub.register(tx_b);
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();
        hub.subscribe(conn_a, user, doc);
        let _ = conn_b;

        hub.publish(user, doc, &ServerMessage::status(doc, 0, BlockStatus::Queued));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_stops_further_delivery() {
        let mut hub = Hub::default();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let conn = hub.register(tx);
        let user = Uuid::new_v4();
        let doc = Uuid::new_v4();
        hub.subscribe(conn, user, doc);
        hub.remove(conn);

        hub.publish(user, doc, &ServerMessage::status(doc, 0, BlockStatus::Queued));
        assert!(rx.try_recv().is_err());
    }
}
