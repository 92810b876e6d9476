//! Key hierarchy manager: password → PDK → UMK, cached per session
//!
//! Session lifecycle:
//! ```text
//! Locked ──restore_umk(password)──▶ Unlocked ──lock / logout / TTL──▶ Locked
//! ```
//! Only unlocked sessions can create or read encrypted files.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nimbus_core::{NimbusError, NimbusResult, UserCredential};
use secrecy::SecretString;
use tracing::{debug, info};

use crate::credential::CredentialStore;
use crate::kdf::{derive_key, generate_salt, KdfParams};
use crate::keys::{generate_umk, unwrap_umk, wrap_umk, UserMasterKey};
use crate::password::{hash_password, verify_password};
use crate::session::{SessionKeyCache, SessionState};

pub struct KeyHierarchy {
    credentials: Arc<dyn CredentialStore>,
    sessions: Arc<SessionKeyCache>,
    params: KdfParams,
    /// Held across load → modify → save of one user's credential
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyHierarchy {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        sessions: Arc<SessionKeyCache>,
        params: KdfParams,
    ) -> Self {
        Self {
            credentials,
            sessions,
            params,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(user_id.to_string()).or_default().clone()
    }

    pub fn sessions(&self) -> &Arc<SessionKeyCache> {
        &self.sessions
    }

    /// Create a credential with a password hash and a freshly wrapped UMK.
    pub fn register(&self, user_id: &str, password: &SecretString) -> NimbusResult<UserCredential> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.credentials.load(user_id)?.is_some() {
            return Err(NimbusError::Storage(format!("user already exists: {user_id}")));
        }

        let mut credential = UserCredential {
            user_id: user_id.to_string(),
            password_hash: hash_password(password, &self.params)?,
            wrapped_umk: None,
            key_salt: None,
        };
        self.install_new_umk(&mut credential, password)?;
        self.credentials.save(&credential)?;

        info!(user_id, "user registered");
        Ok(credential)
    }

    /// Unlock the session's master key with the user's password.
    ///
    /// A session that already holds a key for this user is returned as-is
    /// without re-verifying the password. Credentials created before
    /// encryption existed get a master key on first use; concurrent first
    /// uses all end up with that one persisted key.
    pub fn restore_umk(
        &self,
        session_id: &str,
        user_id: &str,
        password: &SecretString,
    ) -> NimbusResult<Arc<UserMasterKey>> {
        if let Some(umk) = self.sessions.get(session_id) {
            if self.sessions.owner(session_id).as_deref() == Some(user_id) {
                debug!(user_id, "session already unlocked");
                return Ok(umk);
            }
            self.sessions.evict(session_id);
        }

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut credential = self
            .credentials
            .load(user_id)?
            .ok_or(NimbusError::IncorrectPassword)?;
        verify_password(password, &credential.password_hash)?;

        let umk = self.open_umk(&mut credential, password)?;
        info!(user_id, "master key restored for session");
        Ok(self.sessions.insert(session_id, user_id, umk))
    }

    /// Re-wrap the master key under a new password. The UMK itself, and so
    /// every wrapped DEK, is unchanged.
    pub fn change_password(
        &self,
        user_id: &str,
        old_password: &SecretString,
        new_password: &SecretString,
    ) -> NimbusResult<()> {
        let lock = self.user_lock(user_id);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut credential = self
            .credentials
            .load(user_id)?
            .ok_or(NimbusError::IncorrectPassword)?;
        verify_password(old_password, &credential.password_hash)?;

        let umk = self.open_umk(&mut credential, old_password)?;
        let salt = generate_salt();
        let pdk = derive_key(new_password, &salt, &self.params)?;

        credential.wrapped_umk = Some(wrap_umk(&umk, &pdk)?);
        credential.key_salt = Some(salt.to_vec());
        credential.password_hash = hash_password(new_password, &self.params)?;
        self.credentials.save(&credential)?;

        info!(user_id, "password changed, master key re-wrapped");
        Ok(())
    }

    /// Evict the session's key (logout or explicit lock).
    pub fn lock(&self, session_id: &str) -> bool {
        let evicted = self.sessions.evict(session_id);
        if evicted {
            debug!("session locked");
        }
        evicted
    }

    pub fn session_state(&self, session_id: &str) -> SessionState {
        self.sessions.state(session_id)
    }

    /// The unlocked key for `session_id`, or [`NimbusError::SessionLocked`].
    pub fn require_umk(&self, session_id: &str) -> NimbusResult<Arc<UserMasterKey>> {
        self.sessions.get(session_id).ok_or(NimbusError::SessionLocked)
    }

    /// Unwrap the stored UMK, or create and persist one if the credential
    /// predates encryption. The password has already been verified and the
    /// caller holds the user's lock.
    fn open_umk(
        &self,
        credential: &mut UserCredential,
        password: &SecretString,
    ) -> NimbusResult<UserMasterKey> {
        if let (Some(wrapped), Some(salt)) = (&credential.wrapped_umk, &credential.key_salt) {
            let pdk = derive_key(password, salt, &self.params)?;
            return unwrap_umk(wrapped, &pdk).map_err(|e| match e {
                NimbusError::Decryption => NimbusError::IncorrectPassword,
                other => other,
            });
        }

        let umk = self.install_new_umk(credential, password)?;
        self.credentials.save(credential)?;
        info!(user_id = %credential.user_id, "migrated credential to wrapped master key");
        Ok(umk)
    }

    fn install_new_umk(
        &self,
        credential: &mut UserCredential,
        password: &SecretString,
    ) -> NimbusResult<UserMasterKey> {
        let umk = generate_umk();
        let salt = generate_salt();
        let pdk = derive_key(password, &salt, &self.params)?;

        credential.wrapped_umk = Some(wrap_umk(&umk, &pdk)?);
        credential.key_salt = Some(salt.to_vec());
        Ok(umk)
    }
}
