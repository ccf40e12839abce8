//! Account provisioning.
//!
//! The broker treats account creation and removal as an opaque external
//! step behind the [`AccountStore`] trait: the production implementation
//! shells out to `adduser`/`deluser` and resolves identities from the
//! system user database, while tests use an in-memory store.
//!
//! Provisioning a user is a two-step operation (system account, then home
//! directory under the storage root); a failure in the second step runs
//! compensating cleanup so no half-provisioned account survives. A single
//! provisioning mutex serialises creations, since `adduser` itself is not
//! safe to run concurrently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Errors raised by account provisioning.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The account already exists.
    #[error("user already exists: {0}")]
    AlreadyExists(String),

    /// The account does not exist.
    #[error("user does not exist: {0}")]
    NotFound(String),

    /// The external account tool failed.
    #[error("account tool failed: {0}")]
    ToolFailed(String),

    /// Home directory provisioning failed.
    #[error("home directory setup failed: {0}")]
    HomeSetup(String),

    /// System user database lookup failed.
    #[error("user lookup failed: {0}")]
    Lookup(String),
}

/// Result type for account operations.
pub type Result<T> = std::result::Result<T, AccountError>;

/// Resolved Unix identity of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountIdentity {
    /// Unix user id.
    pub uid: u32,
    /// Unix group id.
    pub gid: u32,
}

/// Backend for creating, removing and resolving accounts.
pub trait AccountStore: Send + Sync + 'static {
    /// Create a new account and return its identity.
    fn create(&self, username: &str) -> impl std::future::Future<Output = Result<AccountIdentity>> + Send;

    /// Remove an account.
    fn remove(&self, username: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Resolve an existing account's identity.
    fn lookup(&self, username: &str) -> impl std::future::Future<Output = Result<Option<AccountIdentity>>> + Send;
}

/// Provisions a user: creates the account and its home directory under the
/// storage root, with compensating cleanup on partial failure.
pub async fn provision_user<S: AccountStore>(
    store: &S,
    root: &Path,
    username: &str,
) -> Result<AccountIdentity> {
    if store.lookup(username).await?.is_some() {
        return Err(AccountError::AlreadyExists(username.to_string()));
    }

    let identity = store.create(username).await?;
    info!(username = %username, uid = identity.uid, "Account created");

    let home = root.join(username);
    if let Err(e) = setup_home(&home, identity) {
        error!(username = %username, error = %e, "Home setup failed, removing account");
        if let Err(cleanup) = store.remove(username).await {
            warn!(username = %username, error = %cleanup, "Compensating account removal failed");
        }
        return Err(e);
    }

    Ok(identity)
}

fn setup_home(home: &Path, identity: AccountIdentity) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir(home)
        .map_err(|e| AccountError::HomeSetup(format!("{}: {}", home.display(), e)))?;
    std::fs::set_permissions(home, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| AccountError::HomeSetup(format!("{}: {}", home.display(), e)))?;

    // Ownership reassignment needs privilege; when the broker runs
    // unprivileged (tests, development) the directory stays with the
    // invoking user.
    match std::os::unix::fs::chown(home, Some(identity.uid), Some(identity.gid)) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            warn!(home = %home.display(), "Running unprivileged, leaving home ownership unchanged");
        }
        Err(e) => {
            return Err(AccountError::HomeSetup(format!("{}: {}", home.display(), e)));
        }
    }
    Ok(())
}

/// Production account store backed by `adduser`/`deluser`.
#[derive(Debug, Default)]
pub struct SystemAccounts {
    provision: Mutex<()>,
}

impl SystemAccounts {
    /// Create a new system account store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_tool(program: &str, args: &[&str]) -> Result<()> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AccountError::ToolFailed(format!("{}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AccountError::ToolFailed(format!(
                "{} exited with {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn lookup_sync(username: &str) -> Result<Option<AccountIdentity>> {
        match nix::unistd::User::from_name(username) {
            Ok(Some(user)) => Ok(Some(AccountIdentity {
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(AccountError::Lookup(e.to_string())),
        }
    }
}

impl AccountStore for SystemAccounts {
    async fn create(&self, username: &str) -> Result<AccountIdentity> {
        let _guard = self.provision.lock().await;

        if Self::lookup_sync(username)?.is_some() {
            return Err(AccountError::AlreadyExists(username.to_string()));
        }

        Self::run_tool(
            "adduser",
            &[
                "--disabled-password",
                "--gecos",
                "",
                "--no-create-home",
                username,
            ],
        )
        .await?;

        Self::lookup_sync(username)?
            .ok_or_else(|| AccountError::Lookup(format!("{} missing after adduser", username)))
    }

    async fn remove(&self, username: &str) -> Result<()> {
        if Self::lookup_sync(username)?.is_none() {
            return Err(AccountError::NotFound(username.to_string()));
        }
        Self::run_tool("deluser", &[username]).await
    }

    async fn lookup(&self, username: &str) -> Result<Option<AccountIdentity>> {
        Self::lookup_sync(username)
    }
}

/// In-memory account store for tests. Allocates uids from 10000 up and
/// assigns gid equal to uid.
#[derive(Debug)]
pub struct MemoryAccounts {
    users: StdMutex<HashMap<String, AccountIdentity>>,
    next_uid: StdMutex<u32>,
    /// When set, `create` fails after registering nothing; used to exercise
    /// error paths.
    fail_create: bool,
}

impl MemoryAccounts {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self {
            users: StdMutex::new(HashMap::new()),
            next_uid: StdMutex::new(10_000),
            fail_create: false,
        }
    }

    /// Create a store whose `create` always fails.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    /// Pre-register an account without provisioning a home directory.
    pub fn insert(&self, username: &str, identity: AccountIdentity) {
        self.users
            .lock()
            .unwrap()
            .insert(username.to_string(), identity);
    }
}

impl Default for MemoryAccounts {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for MemoryAccounts {
    async fn create(&self, username: &str) -> Result<AccountIdentity> {
        if self.fail_create {
            return Err(AccountError::ToolFailed("simulated failure".to_string()));
        }
        let mut users = self.users.lock().unwrap();
        if users.contains_key(username) {
            return Err(AccountError::AlreadyExists(username.to_string()));
        }
        let mut next = self.next_uid.lock().unwrap();
        let identity = AccountIdentity {
            uid: *next,
            gid: *next,
        };
        *next += 1;
        users.insert(username.to_string(), identity);
        Ok(identity)
    }

    async fn remove(&self, username: &str) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        if users.remove(username).is_none() {
            return Err(AccountError::NotFound(username.to_string()));
        }
        Ok(())
    }

    async fn lookup(&self, username: &str) -> Result<Option<AccountIdentity>> {
        Ok(self.users.lock().unwrap().get(username).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_create_and_lookup() {
        let store = MemoryAccounts::new();

        let identity = store.create("alice").await.unwrap();
        assert_eq!(identity.uid, 10_000);
        assert_eq!(identity.gid, 10_000);

        let found = store.lookup("alice").await.unwrap();
        assert_eq!(found, Some(identity));
    }

    #[tokio::test]
    async fn test_memory_duplicate_create() {
        let store = MemoryAccounts::new();
        store.create("alice").await.unwrap();

        let result = store.create("alice").await;
        assert!(matches!(result, Err(AccountError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_memory_remove_missing() {
        let store = MemoryAccounts::new();
        let result = store.remove("ghost").await;
        assert!(matches!(result, Err(AccountError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_memory_uids_increase() {
        let store = MemoryAccounts::new();
        let a = store.create("alice").await.unwrap();
        let b = store.create("bob").await.unwrap();
        assert!(b.uid > a.uid);
    }

    #[tokio::test]
    async fn test_provision_creates_home() {
        let temp = TempDir::new().unwrap();
        let store = MemoryAccounts::new();

        provision_user(&store, temp.path(), "alice").await.unwrap();

        let home = temp.path().join("alice");
        assert!(home.is_dir());

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&home).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[tokio::test]
    async fn test_provision_existing_user_rejected() {
        let temp = TempDir::new().unwrap();
        let store = MemoryAccounts::new();
        store.insert("alice", AccountIdentity { uid: 1, gid: 1 });

        let result = provision_user(&store, temp.path(), "alice").await;
        assert!(matches!(result, Err(AccountError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_provision_compensates_on_home_failure() {
        let temp = TempDir::new().unwrap();
        let store = MemoryAccounts::new();
        // Pre-create the home path as a file so directory creation fails
        std::fs::write(temp.path().join("alice"), "occupied").unwrap();

        let result = provision_user(&store, temp.path(), "alice").await;
        assert!(matches!(result, Err(AccountError::HomeSetup(_))));

        // The account must have been removed again
        assert!(store.lookup("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_provision_create_failure() {
        let temp = TempDir::new().unwrap();
        let store = MemoryAccounts::failing();

        let result = provision_user(&store, temp.path(), "alice").await;
        assert!(matches!(result, Err(AccountError::ToolFailed(_))));
        assert!(!temp.path().join("alice").exists());
    }
}
