//! Stream tickets and the per-process registry.
//!
//! The registry owns the at-most-one-active-ticket-per-(owner, conversation)
//! invariant: admission and retirement go through the same map entry, so a
//! racing second dispatch observes the first and fails with a conflict
//! instead of queueing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;
use uuid::Uuid;

/// Identifies the WebSocket connection a ticket belongs to.
pub type ConnectionId = Uuid;

/// Key of the uniqueness invariant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketKey {
    pub owner: String,
    pub conversation_id: String,
}

/// An in-flight dispatch, owned by the dispatcher until retirement.
#[derive(Debug)]
pub struct StreamTicket {
    pub ticket_id: String,
    pub owner: String,
    pub conversation_id: String,
    pub reply_subject: String,
    pub ack_subject: String,
    /// Set for WebSocket dispatches so a closing socket can cancel them.
    pub connection: Option<ConnectionId>,
    pub created_at_ms: i64,
    cancelled: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl StreamTicket {
    fn new(owner: String, conversation_id: String, connection: Option<ConnectionId>) -> Self {
        let ticket_id = Uuid::new_v4().simple().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            reply_subject: reply_subject(&ticket_id),
            ack_subject: ack_subject(&ticket_id),
            ticket_id,
            owner,
            conversation_id,
            connection,
            created_at_ms: Utc::now().timestamp_millis(),
            cancelled: AtomicBool::new(false),
            cancel_tx,
            cancel_rx,
        }
    }

    pub fn key(&self) -> TicketKey {
        TicketKey {
            owner: self.owner.clone(),
            conversation_id: self.conversation_id.clone(),
        }
    }

    /// Cooperative cancel. Idempotent, and a no-op on retired tickets.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Receiver that resolves once the ticket is cancelled, even when the
    /// cancel happened before the receiver is polled.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }
}

/// Fresh reply subject for a ticket.
pub fn reply_subject(ticket_id: &str) -> String {
    format!("resp.{}", ticket_id)
}

/// Fresh ack subject for a ticket (reserved for control messages).
pub fn ack_subject(ticket_id: &str) -> String {
    format!("inbox.{}", ticket_id)
}

/// Process-local registry of active tickets.
#[derive(Default)]
pub struct TicketRegistry {
    active: DashMap<TicketKey, Arc<StreamTicket>>,
}

impl TicketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new ticket. `None` when one is already active for the key.
    pub fn admit(
        &self,
        owner: &str,
        conversation_id: &str,
        connection: Option<ConnectionId>,
    ) -> Option<Arc<StreamTicket>> {
        let key = TicketKey {
            owner: owner.to_string(),
            conversation_id: conversation_id.to_string(),
        };
        match self.active.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let ticket = Arc::new(StreamTicket::new(
                    owner.to_string(),
                    conversation_id.to_string(),
                    connection,
                ));
                slot.insert(ticket.clone());
                Some(ticket)
            }
        }
    }

    /// Retire a ticket. Removes only the matching ticket, so a stale retire
    /// cannot evict a successor already admitted under the same key.
    pub fn retire(&self, ticket: &StreamTicket) {
        self.active
            .remove_if(&ticket.key(), |_, active| active.ticket_id == ticket.ticket_id);
    }

    pub fn get(&self, owner: &str, conversation_id: &str) -> Option<Arc<StreamTicket>> {
        let key = TicketKey {
            owner: owner.to_string(),
            conversation_id: conversation_id.to_string(),
        };
        self.active.get(&key).map(|t| t.clone())
    }

    /// Cancel every active ticket opened by `connection`.
    pub fn cancel_connection(&self, connection: ConnectionId) {
        for entry in self.active.iter() {
            if entry.value().connection == Some(connection) {
                entry.value().cancel();
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_admission_for_the_same_key_is_refused() {
        let registry = TicketRegistry::new();
        let first = registry.admit("alice", "r1", None).unwrap();
        assert!(registry.admit("alice", "r1", None).is_none());

        // Different conversation or owner is fine.
        assert!(registry.admit("alice", "r2", None).is_some());
        assert!(registry.admit("bob", "r1", None).is_some());

        registry.retire(&first);
        assert!(registry.admit("alice", "r1", None).is_some());
    }

    #[test]
    fn subjects_derive_from_the_ticket_id() {
        let registry = TicketRegistry::new();
        let ticket = registry.admit("alice", "r1", None).unwrap();
        assert_eq!(ticket.reply_subject, format!("resp.{}", ticket.ticket_id));
        assert_eq!(ticket.ack_subject, format!("inbox.{}", ticket.ticket_id));
    }

    #[test]
    fn stale_retire_does_not_evict_a_successor() {
        let registry = TicketRegistry::new();
        let first = registry.admit("alice", "r1", None).unwrap();
        registry.retire(&first);

        let second = registry.admit("alice", "r1", None).unwrap();
        registry.retire(&first); // stale
        assert_eq!(
            registry.get("alice", "r1").unwrap().ticket_id,
            second.ticket_id
        );
    }

    #[test]
    fn cancel_is_idempotent_and_survives_retirement() {
        let registry = TicketRegistry::new();
        let ticket = registry.admit("alice", "r1", None).unwrap();

        ticket.cancel();
        ticket.cancel();
        assert!(ticket.is_cancelled());

        registry.retire(&ticket);
        ticket.cancel(); // no-op
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn cancel_signal_fires_even_when_cancelled_first() {
        let registry = TicketRegistry::new();
        let ticket = registry.admit("alice", "r1", None).unwrap();
        ticket.cancel();

        let mut signal = ticket.cancel_signal();
        assert!(signal.has_changed().unwrap());
    }

    #[test]
    fn connection_cancel_only_touches_its_own_tickets() {
        let registry = TicketRegistry::new();
        let conn_a = Uuid::new_v4();
        let conn_b = Uuid::new_v4();

        let a = registry.admit("alice", "r1", Some(conn_a)).unwrap();
        let b = registry.admit("alice", "r2", Some(conn_b)).unwrap();
        let detached = registry.admit("alice", "r3", None).unwrap();

        registry.cancel_connection(conn_a);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!detached.is_cancelled());
    }
}
