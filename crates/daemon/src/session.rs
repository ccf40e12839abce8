//! Per-connection session state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use protocol::CallerIdentity;

/// Authentication state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Connected but not authenticated; only `createuser`, `login` and
    /// `exit` are allowed.
    #[default]
    NotLoggedIn,
    /// Authenticated as a user.
    LoggedIn,
}

/// Session state for one client connection.
#[derive(Debug, Default)]
pub struct ClientSession {
    /// Authentication state.
    pub state: ClientState,
    /// Resolved identity after login.
    pub identity: CallerIdentity,
    /// Registry session id for this login.
    pub registry_session: u64,
    /// Number of background transfers still running on this connection.
    background_ops: Arc<AtomicUsize>,
}

impl ClientSession {
    /// Create a fresh unauthenticated session.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful login.
    pub fn login(&mut self, identity: CallerIdentity, registry_session: u64) {
        self.state = ClientState::LoggedIn;
        self.identity = identity;
        self.identity.workdir = "/".to_string();
        self.registry_session = registry_session;
    }

    /// Whether the connection is authenticated.
    pub fn is_logged_in(&self) -> bool {
        self.state == ClientState::LoggedIn
    }

    /// Username of the logged-in user, empty before login.
    pub fn username(&self) -> &str {
        &self.identity.username
    }

    /// Take a guard counting one background operation; drops decrement.
    pub fn begin_background_op(&self) -> BackgroundGuard {
        self.background_ops.fetch_add(1, Ordering::SeqCst);
        BackgroundGuard {
            counter: self.background_ops.clone(),
        }
    }

    /// Whether any background transfer is still running.
    pub fn has_background_ops(&self) -> bool {
        self.background_ops.load(Ordering::SeqCst) > 0
    }
}

/// RAII guard for one in-flight background operation.
#[derive(Debug)]
pub struct BackgroundGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for BackgroundGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let session = ClientSession::new();
        assert!(!session.is_logged_in());
        assert!(!session.has_background_ops());
        assert_eq!(session.username(), "");
    }

    #[test]
    fn test_login_resets_workdir() {
        let mut session = ClientSession::new();
        let identity = CallerIdentity {
            uid: 1000,
            gid: 1000,
            username: "alice".to_string(),
            home: "alice".to_string(),
            workdir: "/stale".to_string(),
        };

        session.login(identity, 7);

        assert!(session.is_logged_in());
        assert_eq!(session.username(), "alice");
        assert_eq!(session.identity.workdir, "/");
        assert_eq!(session.registry_session, 7);
    }

    #[test]
    fn test_background_guard_counts() {
        let session = ClientSession::new();

        let guard1 = session.begin_background_op();
        let guard2 = session.begin_background_op();
        assert!(session.has_background_ops());

        drop(guard1);
        assert!(session.has_background_ops());

        drop(guard2);
        assert!(!session.has_background_ops());
    }
}
