//! Shared registry of online users and pending transfers.
//!
//! One mutex guards the whole registry. Every method takes the lock, mutates
//! or snapshots, and returns before any I/O happens; notification delivery
//! goes through the per-user channels so no socket write ever runs under the
//! lock. Capacity limits are enforced on both tables and surface as distinct
//! errors.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info};

use crate::notify::{Notification, NotifySender, TransferEvent};

/// Errors raised by registry operations.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    /// The online-user table is full.
    #[error("Server busy: Too many active users")]
    TooManyUsers,

    /// The transfer table is full.
    #[error("Server busy: Too many pending transfers")]
    TooManyTransfers,

    /// No ticket with the given id.
    #[error("Request ID not found")]
    TicketNotFound,

    /// The ticket is addressed to a different user.
    #[error("This transfer is not for you")]
    NotYourTransfer,

    /// The target user is not online.
    #[error("User is not online")]
    UserNotOnline,
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Lifecycle of a transfer ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Created; the receiver has not been told yet.
    Pending,
    /// The receiver's connection has announced it.
    Notified,
    /// The receiver rejected it; awaiting sender notification.
    Rejected,
}

/// A pending user-to-user transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTicket {
    /// Unique ticket id.
    pub id: u64,
    /// The offering user.
    pub sender: String,
    /// The addressed user.
    pub receiver: String,
    /// File on offer, relative to the sender's home.
    pub filename: String,
    /// Current lifecycle state.
    pub status: TransferStatus,
}

/// One login of an online user. A username may be logged in from several
/// connections at once; each login holds its own entry.
#[derive(Debug)]
struct UserEntry {
    session_id: u64,
    notify: NotifySender,
}

#[derive(Debug, Default)]
struct RegistryInner {
    users: HashMap<String, Vec<UserEntry>>,
    tickets: HashMap<u64, TransferTicket>,
    next_ticket_id: u64,
    next_session_id: u64,
}

/// Shared registry of online users and transfer tickets.
#[derive(Debug)]
pub struct SharedRegistry {
    inner: Mutex<RegistryInner>,
    max_users: usize,
    max_transfers: usize,
}

impl SharedRegistry {
    /// Create a registry with the given capacity limits.
    pub fn new(max_users: usize, max_transfers: usize) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            max_users,
            max_transfers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a login as online. Returns the session id identifying this
    /// login, needed to deactivate it later. The same username may hold
    /// several concurrent logins; the capacity limit counts logins, not
    /// distinct usernames.
    pub fn register(&self, username: &str, notify: NotifySender) -> Result<u64> {
        let mut inner = self.lock();

        let logins: usize = inner.users.values().map(Vec::len).sum();
        if logins >= self.max_users {
            return Err(RegistryError::TooManyUsers);
        }

        inner.next_session_id += 1;
        let session_id = inner.next_session_id;
        inner
            .users
            .entry(username.to_string())
            .or_default()
            .push(UserEntry { session_id, notify });

        info!(username = %username, session_id, "User online");
        Ok(session_id)
    }

    /// Deactivate one login of a user. Only the entry with the matching
    /// session id is removed, so a concurrent login of the same username
    /// stays online and a stale disconnect cannot evict a newer login.
    /// Tickets addressed to the user are freed once their last login is
    /// gone.
    pub fn deactivate(&self, username: &str, session_id: u64) {
        let mut inner = self.lock();

        let Some(entries) = inner.users.get_mut(username) else {
            return;
        };
        let Some(at) = entries.iter().position(|e| e.session_id == session_id) else {
            return;
        };
        entries.remove(at);

        if entries.is_empty() {
            inner.users.remove(username);
            inner.tickets.retain(|_, ticket| ticket.receiver != username);
        }

        info!(username = %username, session_id, "User offline");
    }

    /// Whether the user is currently online.
    pub fn is_online(&self, username: &str) -> bool {
        self.lock().users.contains_key(username)
    }

    /// Number of active logins.
    pub fn online_count(&self) -> usize {
        self.lock().users.values().map(Vec::len).sum()
    }

    /// Create a transfer ticket and wake every connection the receiver
    /// holds.
    ///
    /// The receiver must be online.
    pub fn create_ticket(&self, sender: &str, receiver: &str, filename: &str) -> Result<u64> {
        let (id, notifies) = {
            let mut inner = self.lock();

            if inner.tickets.len() >= self.max_transfers {
                return Err(RegistryError::TooManyTransfers);
            }
            let notifies: Vec<NotifySender> = match inner.users.get(receiver) {
                Some(entries) => entries.iter().map(|e| e.notify.clone()).collect(),
                None => return Err(RegistryError::UserNotOnline),
            };

            inner.next_ticket_id += 1;
            let id = inner.next_ticket_id;
            inner.tickets.insert(
                id,
                TransferTicket {
                    id,
                    sender: sender.to_string(),
                    receiver: receiver.to_string(),
                    filename: filename.to_string(),
                    status: TransferStatus::Pending,
                },
            );

            debug!(id, sender = %sender, receiver = %receiver, "Transfer ticket created");
            (id, notifies)
        };

        // Channel sends happen after the lock is released; a closed channel
        // just means that login is disconnecting and cleanup will follow.
        for notify in notifies {
            let _ = notify.send(TransferEvent::IncomingRequest);
        }

        Ok(id)
    }

    /// Collect the notifications due for a user.
    ///
    /// Pending tickets addressed to the user transition to Notified and are
    /// returned as incoming notifications; rejected tickets the user sent
    /// are returned as rejection notices and freed. The caller delivers the
    /// returned notifications after this method releases the lock.
    pub fn collect_notifications(&self, username: &str) -> Vec<Notification> {
        let mut inner = self.lock();
        let mut notifications = Vec::new();
        let mut freed = Vec::new();

        for ticket in inner.tickets.values_mut() {
            match ticket.status {
                TransferStatus::Pending if ticket.receiver == username => {
                    ticket.status = TransferStatus::Notified;
                    notifications.push(Notification::Incoming {
                        id: ticket.id,
                        sender: ticket.sender.clone(),
                        filename: ticket.filename.clone(),
                    });
                }
                TransferStatus::Rejected if ticket.sender == username => {
                    notifications.push(Notification::Rejected {
                        id: ticket.id,
                        receiver: ticket.receiver.clone(),
                    });
                    freed.push(ticket.id);
                }
                _ => {}
            }
        }

        for id in freed {
            inner.tickets.remove(&id);
        }

        notifications
    }

    /// Accept a ticket: it must exist, be in Notified state, and be
    /// addressed to the caller. The ticket is freed and returned so the
    /// caller can run the copy.
    pub fn accept_ticket(&self, id: u64, username: &str) -> Result<TransferTicket> {
        let mut inner = self.lock();

        let ticket = inner.tickets.get(&id).ok_or(RegistryError::TicketNotFound)?;
        if ticket.receiver != username {
            return Err(RegistryError::NotYourTransfer);
        }
        if ticket.status != TransferStatus::Notified {
            return Err(RegistryError::TicketNotFound);
        }

        inner.tickets.remove(&id).ok_or(RegistryError::TicketNotFound)
    }

    /// Reject a ticket: marks it Rejected and wakes the sender's
    /// connections so one of them announces the rejection.
    pub fn reject_ticket(&self, id: u64, username: &str) -> Result<()> {
        let notifies = {
            let mut inner = self.lock();

            let ticket = inner
                .tickets
                .get_mut(&id)
                .ok_or(RegistryError::TicketNotFound)?;
            if ticket.receiver != username {
                return Err(RegistryError::NotYourTransfer);
            }

            ticket.status = TransferStatus::Rejected;
            let sender = ticket.sender.clone();
            debug!(id, sender = %sender, receiver = %username, "Transfer rejected");

            inner
                .users
                .get(&sender)
                .map(|entries| entries.iter().map(|e| e.notify.clone()).collect::<Vec<_>>())
                .unwrap_or_default()
        };

        for notify in notifies {
            let _ = notify.send(TransferEvent::Rejection);
        }
        Ok(())
    }
}
