//! Persistent key store.
//!
//! One table holds the server's own host key (under the reserved
//! `"localhost"` identifier, PEM encoded) and the known client public keys
//! (one-line authorized-keys form). SQLite, thread-safe via a mutex; all
//! operations run inside transactions.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, ErrorCode};
use russh::keys::PublicKey;

use crate::error::Error;

/// Reserved identifier for the server's own host private key.
pub const HOST_KEY_IDENTIFIER: &str = "localhost";

const TABLE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sshkeys (
    id          INTEGER PRIMARY KEY,
    identifier  TEXT NOT NULL UNIQUE,
    keystring   TEXT NOT NULL,
    created_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    deleted_at  TIMESTAMP
);
";

/// Key store handle (thread-safe via Mutex).
pub struct KeyStore {
    conn: Mutex<Connection>,
}

impl KeyStore {
    /// Open or create the store at path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), Error> {
        self.conn()?.execute_batch(TABLE_SCHEMA)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, Error> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Upsert the host private key under the `"localhost"` identifier.
    /// Inserts when absent, updates the key material when present; affects
    /// exactly one row either way.
    pub fn set_host_key(&self, pem: &str) -> Result<(), Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "INSERT INTO sshkeys (identifier, keystring) VALUES (?1, ?2)
             ON CONFLICT(identifier)
             DO UPDATE SET keystring = excluded.keystring, updated_at = CURRENT_TIMESTAMP",
            params![HOST_KEY_IDENTIFIER, pem],
        )?;
        if affected != 1 {
            return Err(Error::Store(rusqlite::Error::StatementChangedRows(affected)));
        }
        tx.commit()?;
        Ok(())
    }

    /// Read the host private key. `Error::KeyNotFound` when absent.
    pub fn get_host_key(&self) -> Result<String, Error> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let keystring = match tx.query_row(
            "SELECT keystring FROM sshkeys
             WHERE identifier = ?1 AND deleted_at IS NULL",
            [HOST_KEY_IDENTIFIER],
            |row| row.get::<_, String>(0),
        ) {
            Ok(keystring) => keystring,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::KeyNotFound),
            Err(err) => return Err(err.into()),
        };
        tx.commit()?;
        Ok(keystring)
    }

    /// Insert one known client key. `Error::HostAlreadyKnown` when the
    /// identifier is taken.
    pub fn add_known_host(&self, identifier: &str, key: &PublicKey) -> Result<(), Error> {
        let keystring = canonical(key)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        match tx.execute(
            "INSERT INTO sshkeys (identifier, keystring) VALUES (?1, ?2)",
            params![identifier, keystring],
        ) {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => return Err(Error::HostAlreadyKnown),
            Err(err) => return Err(err.into()),
        }
        tx.commit()?;
        Ok(())
    }

    /// Compare the stored key for `identifier` against the presented one.
    /// `Ok(true)` only on a canonical byte-equal match; `Error::KeyNotFound`
    /// when the identifier has no record.
    pub fn check_known_host(&self, identifier: &str, key: &PublicKey) -> Result<bool, Error> {
        let stored = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let keystring = match tx.query_row(
                "SELECT keystring FROM sshkeys
                 WHERE identifier = ?1 AND deleted_at IS NULL",
                [identifier],
                |row| row.get::<_, String>(0),
            ) {
                Ok(keystring) => keystring,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Err(Error::KeyNotFound),
                Err(err) => return Err(err.into()),
            };
            tx.commit()?;
            keystring
        };
        let stored_key = PublicKey::from_openssh(&stored)?;
        Ok(canonical(&stored_key)? == canonical(key)?)
    }
}

/// Canonical one-line authorized-keys form, trailing whitespace trimmed.
/// This is the only admissible equality on public keys.
pub fn canonical(key: &PublicKey) -> Result<String, Error> {
    Ok(key.to_openssh()?.trim_end().to_string())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}
