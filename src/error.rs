//! Error kinds exposed by the server core.

use thiserror::Error;

type Reason = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the key store, auth manager, shell and server.
#[derive(Debug, Error)]
pub enum Error {
    /// Client presented a key type outside the allowlist.
    #[error("key type not supported")]
    KeyNotSupported,

    /// Generic auth rejection. Terminal for the auth attempt, not for the
    /// connection; the client may retry up to the configured limit. The
    /// optional reason carries a diagnostic without changing the kind.
    #[error("authentication failed")]
    AuthFailed {
        #[source]
        reason: Option<Reason>,
    },

    /// Store lookup miss. Often benign (triggers host-key seeding).
    #[error("no key found")]
    KeyNotFound,

    /// Unique violation when adding a known host.
    #[error("host already known")]
    HostAlreadyKnown,

    /// Shell dispatch miss, reported to the user as a stderr line.
    #[error("command not found")]
    CommandNotFound,

    /// `serve` called twice without a shutdown in between.
    #[error("worker pool already initialized")]
    WorkerPoolAlreadyInitialized,

    /// The pool has shut down and no longer accepts tasks.
    #[error("worker pool is not running")]
    WorkerPoolStopped,

    /// Server constructed without a key store.
    #[error("missing key store")]
    MissingKeyStore,

    /// Anything that went wrong while loading the SSH configuration or
    /// reconciling the host key.
    #[error("error loading ssh config: {source}")]
    SshConfig {
        #[source]
        source: Reason,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error("key error: {0}")]
    Key(#[from] russh::keys::ssh_key::Error),

    #[error("key load error: {0}")]
    KeyLoad(#[from] russh::keys::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Plain auth rejection, no diagnostic.
    pub fn auth_failed() -> Self {
        Error::AuthFailed { reason: None }
    }

    /// Auth rejection carrying a diagnostic; matches as `AuthFailed`.
    pub fn auth_failed_because(reason: impl Into<Reason>) -> Self {
        Error::AuthFailed {
            reason: Some(reason.into()),
        }
    }

    /// Wrap a config-load or host-key reconciliation failure.
    pub fn ssh_config(source: impl Into<Reason>) -> Self {
        Error::SshConfig {
            source: source.into(),
        }
    }

    /// True for the whole `AuthFailed` kind, with or without a reason.
    pub fn is_auth_failed(&self) -> bool {
        matches!(self, Error::AuthFailed { .. })
    }
}
