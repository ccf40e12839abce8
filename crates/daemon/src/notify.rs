//! Transfer notification channels.
//!
//! Each online user has an unbounded mpsc channel registered alongside its
//! registry entry. Registry operations push a [`TransferEvent`] wake-up into
//! the channel; the owning connection loop then drains the registry for the
//! actual notification content and writes text messages to the client. This
//! keeps all I/O outside the registry lock.

use tokio::sync::mpsc;

/// Wake-up event delivered to a connection when its user has pending
/// notifications to collect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEvent {
    /// Someone requested a transfer to this user.
    IncomingRequest,
    /// A transfer this user sent was rejected.
    Rejection,
}

/// Sending side of a user's notification channel.
pub type NotifySender = mpsc::UnboundedSender<TransferEvent>;

/// Receiving side of a user's notification channel.
pub type NotifyReceiver = mpsc::UnboundedReceiver<TransferEvent>;

/// Create a notification channel pair.
pub fn channel() -> (NotifySender, NotifyReceiver) {
    mpsc::unbounded_channel()
}

/// A notification ready to be delivered to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// An incoming transfer request for this user.
    Incoming {
        /// Ticket id to accept or reject.
        id: u64,
        /// Sending user.
        sender: String,
        /// File on offer.
        filename: String,
    },
    /// A transfer this user requested was rejected.
    Rejected {
        /// Ticket id that was rejected.
        id: u64,
        /// The user who rejected it.
        receiver: String,
    },
}

impl Notification {
    /// Render the notification as the text sent to the client.
    pub fn to_text(&self) -> String {
        match self {
            Notification::Incoming {
                id,
                sender,
                filename,
            } => format!(
                "Transfer request #{}: {} wants to send you '{}' (accept/reject)",
                id, sender, filename
            ),
            Notification::Rejected { id, receiver } => {
                format!("Transfer request #{} was rejected by {}", id, receiver)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incoming_text() {
        let n = Notification::Incoming {
            id: 3,
            sender: "alice".to_string(),
            filename: "report.pdf".to_string(),
        };
        assert_eq!(
            n.to_text(),
            "Transfer request #3: alice wants to send you 'report.pdf' (accept/reject)"
        );
    }

    #[test]
    fn test_rejected_text() {
        let n = Notification::Rejected {
            id: 7,
            receiver: "bob".to_string(),
        };
        assert_eq!(n.to_text(), "Transfer request #7 was rejected by bob");
    }

    #[tokio::test]
    async fn test_channel_delivers_events() {
        let (tx, mut rx) = channel();
        tx.send(TransferEvent::IncomingRequest).unwrap();
        assert_eq!(rx.recv().await, Some(TransferEvent::IncomingRequest));
    }
}
