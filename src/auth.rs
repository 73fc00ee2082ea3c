//! Authentication management.
//!
//! Supplies the checks behind the SSH library's auth callbacks and owns the
//! host-key lifecycle. Every public-key validation goes through the key
//! store; nothing is cached.

use std::collections::HashMap;
use std::sync::Arc;

use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{decode_secret_key, HashAlg, PrivateKey, PublicKey};

use crate::error::Error;
use crate::keystore::KeyStore;

/// Distinguished user name that bypasses key verification.
pub const GUEST_USER: &str = "guest";

/// Extension key carrying the fingerprint of the authenticated key.
pub const PUBKEY_FP: &str = "pubkey-fp";

/// Key algorithms accepted for client keys in the persistent-auth path.
pub fn is_supported(algorithm: &Algorithm) -> bool {
    matches!(algorithm, Algorithm::Ed25519)
}

/// Key algorithms the server advertises during the offer phase. Broader
/// than the validated set: rsa offers are accepted but fail validation.
pub fn is_advertised(algorithm: &Algorithm) -> bool {
    matches!(algorithm, Algorithm::Ed25519 | Algorithm::Rsa { .. })
}

/// The outcome of successful authentication, carried through the session.
#[derive(Debug, Clone, Default)]
pub struct Permissions {
    pub critical_options: HashMap<String, String>,
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    fn guest() -> Self {
        let mut permissions = Self::default();
        permissions
            .extensions
            .insert(PUBKEY_FP.to_string(), GUEST_USER.to_string());
        permissions
    }

    fn validated(key: &PublicKey) -> Self {
        let mut permissions = Self::default();
        permissions.critical_options.insert(
            PUBKEY_FP.to_string(),
            key.fingerprint(HashAlg::Sha256).to_string(),
        );
        permissions
            .extensions
            .insert("permit-X11-forwarding".to_string(), "true".to_string());
        permissions
            .extensions
            .insert("permit-agent-forwarding".to_string(), "true".to_string());
        permissions
    }

    /// Fingerprint entry, wherever it was recorded.
    pub fn fingerprint(&self) -> Option<&str> {
        self.critical_options
            .get(PUBKEY_FP)
            .or_else(|| self.extensions.get(PUBKEY_FP))
            .map(String::as_str)
    }
}

/// Validates incoming credentials against the key store.
pub struct AuthManager {
    store: Arc<KeyStore>,
}

impl AuthManager {
    pub fn new(store: Arc<KeyStore>) -> Self {
        Self { store }
    }

    fn guest_login(&self, user: &str) -> Option<Permissions> {
        (user == GUEST_USER).then(Permissions::guest)
    }

    /// Public-key validation. Guest bypasses the store; everyone else must
    /// present a supported key that matches their stored record.
    pub fn publickey(&self, user: &str, key: &PublicKey) -> Result<Permissions, Error> {
        if let Some(guest) = self.guest_login(user) {
            return Ok(guest);
        }

        if !is_supported(&key.algorithm()) {
            return Err(Error::KeyNotSupported);
        }

        match self.store.check_known_host(user, key) {
            Ok(true) => Ok(Permissions::validated(key)),
            Ok(false) => Err(Error::auth_failed()),
            Err(err) => Err(Error::auth_failed_because(err)),
        }
    }

    /// Password authentication is not supported; the guest user is let
    /// through without a password check.
    pub fn password(&self, user: &str, _password: &str) -> Result<Permissions, Error> {
        if let Some(guest) = self.guest_login(user) {
            return Ok(guest);
        }
        Err(Error::auth_failed_because(
            "password authentication not supported",
        ))
    }

    /// The "none" method succeeds only for the guest user.
    pub fn no_auth(&self, user: &str) -> Result<Permissions, Error> {
        if let Some(guest) = self.guest_login(user) {
            return Ok(guest);
        }
        Err(Error::auth_failed_because(
            "no authentication method supported",
        ))
    }

    /// Obtain the host private key and make the store agree with it.
    ///
    /// A configured key wins over the stored one; absence of configuration
    /// never clobbers persisted state. Idempotent for a fixed configuration
    /// and store state.
    pub fn ensure_host_key(&self, configured: Option<&str>) -> Result<String, Error> {
        let (pem, config_set) = match configured {
            Some(raw) => {
                // decode and re-encode to the canonical PEM form
                let key = decode_secret_key(raw, None)?;
                (key.to_openssh(LineEnding::LF)?.to_string(), true)
            }
            None => {
                let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)?;
                (key.to_openssh(LineEnding::LF)?.to_string(), false)
            }
        };

        let stored = match self.store.get_host_key() {
            Ok(stored) => Some(stored),
            Err(Error::KeyNotFound) => None,
            Err(err) => return Err(err),
        };

        match stored {
            None => {
                tracing::info!("seeding host key");
                self.store.set_host_key(&pem)?;
                Ok(pem)
            }
            Some(stored) if config_set && stored != pem => {
                tracing::info!("overwriting stored host key from configuration");
                self.store.set_host_key(&pem)?;
                Ok(pem)
            }
            Some(stored) => Ok(stored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (AuthManager, Arc<KeyStore>) {
        let store = Arc::new(KeyStore::in_memory().unwrap());
        (AuthManager::new(store.clone()), store)
    }

    fn generate() -> PrivateKey {
        PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519).unwrap()
    }

    #[test]
    fn advertised_set_is_broader_than_validated() {
        // rsa is offered for interoperability but never validated; only
        // ed25519 passes the final check. Deliberate asymmetry.
        assert!(is_supported(&Algorithm::Ed25519));
        assert!(is_advertised(&Algorithm::Ed25519));
        assert!(!is_supported(&Algorithm::Rsa { hash: None }));
        assert!(is_advertised(&Algorithm::Rsa { hash: None }));
        assert!(!is_advertised(&Algorithm::Dsa));
    }

    #[test]
    fn guest_bypasses_the_store() {
        let (auth, _store) = manager();
        let key = generate().public_key().clone();
        let permissions = auth.publickey(GUEST_USER, &key).unwrap();
        assert_eq!(permissions.fingerprint(), Some(GUEST_USER));
    }

    #[test]
    fn unknown_user_fails_with_auth_failed_kind() {
        let (auth, _store) = manager();
        let key = generate().public_key().clone();
        let err = auth.publickey("alice", &key).unwrap_err();
        assert!(err.is_auth_failed());
    }

    #[test]
    fn known_key_is_granted_forwarding_permissions() {
        let (auth, store) = manager();
        let key = generate().public_key().clone();
        store.add_known_host("alice", &key).unwrap();

        let permissions = auth.publickey("alice", &key).unwrap();
        let fingerprint = permissions.critical_options.get(PUBKEY_FP).unwrap();
        assert_eq!(
            fingerprint,
            &key.fingerprint(HashAlg::Sha256).to_string()
        );
        assert_eq!(
            permissions.extensions.get("permit-X11-forwarding"),
            Some(&"true".to_string())
        );
        assert_eq!(
            permissions.extensions.get("permit-agent-forwarding"),
            Some(&"true".to_string())
        );
    }

    #[test]
    fn wrong_key_for_known_user_fails() {
        let (auth, store) = manager();
        store
            .add_known_host("alice", generate().public_key())
            .unwrap();
        let other = generate().public_key().clone();
        assert!(auth.publickey("alice", &other).unwrap_err().is_auth_failed());
    }

    #[test]
    fn password_auth_is_guest_only() {
        let (auth, _store) = manager();
        let permissions = auth.password(GUEST_USER, "anything").unwrap();
        assert_eq!(permissions.fingerprint(), Some(GUEST_USER));
        assert!(auth.password("alice", "hunter2").unwrap_err().is_auth_failed());
    }

    #[test]
    fn no_auth_is_guest_only() {
        let (auth, _store) = manager();
        assert!(auth.no_auth(GUEST_USER).is_ok());
        assert!(auth.no_auth("alice").unwrap_err().is_auth_failed());
    }

    #[test]
    fn ensure_host_key_seeds_an_empty_store() {
        let (auth, store) = manager();
        let pem = auth.ensure_host_key(None).unwrap();
        assert_eq!(store.get_host_key().unwrap(), pem);
        // the stored key is a parseable ed25519 private key
        let key = decode_secret_key(&pem, None).unwrap();
        assert_eq!(key.algorithm(), Algorithm::Ed25519);
    }

    #[test]
    fn ensure_host_key_is_idempotent() {
        let (auth, store) = manager();
        auth.ensure_host_key(None).unwrap();
        let first = store.get_host_key().unwrap();
        auth.ensure_host_key(None).unwrap();
        assert_eq!(store.get_host_key().unwrap(), first);
    }

    #[test]
    fn configured_key_overwrites_the_stored_one() {
        let (auth, store) = manager();
        store.set_host_key("stale pem").unwrap();

        let configured = generate().to_openssh(LineEnding::LF).unwrap();
        let active = auth.ensure_host_key(Some(&configured)).unwrap();
        assert_eq!(store.get_host_key().unwrap(), active);
        assert_ne!(active, "stale pem");
    }

    #[test]
    fn stored_key_survives_missing_configuration() {
        let (auth, store) = manager();
        let existing = generate().to_openssh(LineEnding::LF).unwrap().to_string();
        store.set_host_key(&existing).unwrap();

        let active = auth.ensure_host_key(None).unwrap();
        assert_eq!(active, existing);
        assert_eq!(store.get_host_key().unwrap(), existing);
    }

    #[test]
    fn configured_key_is_canonicalized() {
        let (auth, store) = manager();
        let key = generate();
        let pem = key.to_openssh(LineEnding::LF).unwrap();

        let active = auth.ensure_host_key(Some(&pem)).unwrap();
        assert_eq!(active, pem.to_string());
        assert_eq!(store.get_host_key().unwrap(), active);
        // repeat run with the same configuration changes nothing
        let again = auth.ensure_host_key(Some(&pem)).unwrap();
        assert_eq!(again, active);
    }
}
