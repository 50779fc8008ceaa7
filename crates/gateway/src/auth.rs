//! Credential checks for `Login` and `Register`.
//!
//! These only consult the credential store. Whether the user is already
//! online is decided by the registry when the session joins.

use {
    duet_protocol::AuthError,
    secrecy::{ExposeSecret, Secret},
    tracing::{debug, warn},
};

use duet_store::CredentialStore;

/// A name and password as received from the wire.
pub struct Credentials {
    pub name: String,
    pub password: Secret<String>,
}

impl Credentials {
    pub fn new(name: String, password: String) -> Self {
        Self {
            name,
            password: Secret::new(password),
        }
    }

    /// Names that can never belong to a user.
    fn name_is_blank(&self) -> bool {
        self.name.trim().is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("name", &self.name)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Constant-time string comparison.
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Check a login attempt against the stored credential.
pub async fn verify_login(
    store: &dyn CredentialStore,
    creds: &Credentials,
) -> Result<(), AuthError> {
    if creds.name_is_blank() {
        return Err(AuthError::UserNotFound);
    }
    let stored = match store.lookup(&creds.name).await {
        Ok(Some(stored)) => stored,
        Ok(None) => return Err(AuthError::UserNotFound),
        Err(e) => {
            warn!(name = %creds.name, error = %e, "credential lookup failed");
            return Err(AuthError::UserNotFound);
        },
    };
    if !safe_equal(creds.password.expose_secret(), &stored) {
        debug!(name = %creds.name, "password mismatch");
        return Err(AuthError::WrongPassword);
    }
    Ok(())
}

/// Create a new account. Fails with `UserExist` if the name is taken,
/// including when another registration for the same name wins a race.
pub async fn register_user(
    store: &dyn CredentialStore,
    creds: &Credentials,
) -> Result<(), AuthError> {
    if creds.name_is_blank() {
        return Err(AuthError::UserExist);
    }
    match store
        .insert(&creds.name, creds.password.expose_secret())
        .await
    {
        Ok(true) => Ok(()),
        Ok(false) => Err(AuthError::UserExist),
        Err(e) => {
            warn!(name = %creds.name, error = %e, "credential insert failed");
            Err(AuthError::UserExist)
        },
    }
}
