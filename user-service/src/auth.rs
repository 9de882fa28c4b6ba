use tracing::{debug, warn};

use crate::app::AppState;
use crate::error::ProviderError;
use crate::external_auth;
use crate::store::UserStore;
use crate::users::{now_ms, User};

/// Callback answering keyboard-interactive challenges on behalf of the
/// connected client: `(username, instruction, questions, echos) -> answers`.
pub type KeyboardChallenge<'a> = &'a mut (dyn FnMut(&str, &str, &[String], &[bool]) -> Result<Vec<String>, ProviderError>
             + Send);

/// Authenticate `username` with a password, either through the configured
/// external program (scope bit 0) or the store's own credential check.
pub async fn check_password(
    state: &AppState,
    username: &str,
    password: &str,
) -> Result<User, ProviderError> {
    let result = check_password_inner(state, username, password).await;
    state
        .metrics
        .record_auth_attempt("password", result.is_ok());
    result
}

async fn check_password_inner(
    state: &AppState,
    username: &str,
    password: &str,
) -> Result<User, ProviderError> {
    if state.config.password_auth_is_external() {
        let user = external_auth::authenticate(state, username, password, None, false).await?;
        return verify_user_password(user, password);
    }
    state.store.authenticate_password(username, password).await
}

/// Authenticate `username` with an SSH public key in wire format. On success
/// the matched key is identified as `SHA256:<fingerprint>:<comment>`.
pub async fn check_public_key(
    state: &AppState,
    username: &str,
    public_key: &[u8],
) -> Result<(User, String), ProviderError> {
    let result = check_public_key_inner(state, username, public_key).await;
    state
        .metrics
        .record_auth_attempt("public_key", result.is_ok());
    result
}

async fn check_public_key_inner(
    state: &AppState,
    username: &str,
    public_key: &[u8],
) -> Result<(User, String), ProviderError> {
    if state.config.public_key_auth_is_external() {
        let user =
            external_auth::authenticate(state, username, "", Some(public_key), false).await?;
        return verify_user_public_key(user, public_key);
    }
    state
        .store
        .authenticate_public_key(username, public_key)
        .await
}

/// Authenticate `username` through a keyboard-interactive exchange driven by
/// `auth_program`. The user record comes from the external auth program
/// (scope bit 2) or a plain store lookup.
pub async fn check_keyboard_interactive(
    state: &AppState,
    username: &str,
    auth_program: &str,
    challenge: KeyboardChallenge<'_>,
) -> Result<User, ProviderError> {
    let result = check_keyboard_interactive_inner(state, username, auth_program, challenge).await;
    state
        .metrics
        .record_auth_attempt("keyboard_interactive", result.is_ok());
    result
}

async fn check_keyboard_interactive_inner(
    state: &AppState,
    username: &str,
    auth_program: &str,
    challenge: KeyboardChallenge<'_>,
) -> Result<User, ProviderError> {
    let user = if state.config.keyboard_auth_is_external() {
        external_auth::authenticate(state, username, "", None, true).await?
    } else {
        state.store.user_by_name(username).await?
    };
    check_login_conditions(&user)?;
    external_auth::keyboard_interactive_auth(user, auth_program, challenge).await
}

/// Reject disabled and expired accounts before any credential check. The
/// precise cause stays in the logs; callers only see a uniform
/// authentication failure.
pub(crate) fn check_login_conditions(user: &User) -> Result<(), ProviderError> {
    if user.status < 1 {
        debug!(username = %user.username, "login denied: account is disabled");
        return Err(ProviderError::InvalidCredentials);
    }
    if user.expiration_date > 0 && user.expiration_date < now_ms() {
        debug!(
            username = %user.username,
            expiration_date = user.expiration_date,
            "login denied: account has expired"
        );
        return Err(ProviderError::InvalidCredentials);
    }
    Ok(())
}

pub(crate) fn verify_user_password(user: User, password: &str) -> Result<User, ProviderError> {
    check_login_conditions(&user)?;
    if user.password.is_empty() || password.is_empty() {
        debug!(username = %user.username, "login denied: empty credentials");
        return Err(ProviderError::InvalidCredentials);
    }
    match common_passhash::verify_password(&user.password, password) {
        Ok(true) => Ok(user),
        Ok(false) => {
            debug!(username = %user.username, "login denied: password mismatch");
            Err(ProviderError::InvalidCredentials)
        }
        Err(err) => {
            warn!(
                username = %user.username,
                error = %err,
                "could not verify stored password hash"
            );
            Err(ProviderError::PasswordHash(err))
        }
    }
}

pub(crate) fn verify_user_public_key(
    user: User,
    public_key: &[u8],
) -> Result<(User, String), ProviderError> {
    check_login_conditions(&user)?;
    if user.public_keys.is_empty() {
        debug!(username = %user.username, "login denied: no public keys on record");
        return Err(ProviderError::InvalidCredentials);
    }
    for (idx, line) in user.public_keys.iter().enumerate() {
        let stored = ssh_key::PublicKey::from_openssh(line).map_err(|err| {
            warn!(
                username = %user.username,
                key_index = idx,
                error = %err,
                "could not parse stored public key"
            );
            ProviderError::validation(format!("could not parse stored public key {idx}: {err}"))
        })?;
        let stored_blob = stored.to_bytes().map_err(|err| {
            ProviderError::validation(format!("could not encode stored public key {idx}: {err}"))
        })?;
        if stored_blob == public_key {
            let identifier = format!(
                "{}:{}",
                stored.fingerprint(ssh_key::HashAlg::Sha256),
                stored.comment()
            );
            return Ok((user, identifier));
        }
    }
    debug!(username = %user.username, "login denied: no matching public key");
    Err(ProviderError::InvalidCredentials)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::users::USER_STATUS_ENABLED;

    fn enabled_user() -> User {
        User {
            username: "alice".to_string(),
            status: USER_STATUS_ENABLED,
            ..User::default()
        }
    }

    #[test]
    fn disabled_users_cannot_log_in() {
        let mut user = enabled_user();
        user.status = 0;
        assert!(matches!(
            check_login_conditions(&user),
            Err(ProviderError::InvalidCredentials)
        ));
    }

    #[test]
    fn expired_users_cannot_log_in() {
        let mut user = enabled_user();
        user.expiration_date = now_ms() - 1_000;
        assert!(matches!(
            check_login_conditions(&user),
            Err(ProviderError::InvalidCredentials)
        ));
        user.expiration_date = now_ms() + 60_000;
        assert!(check_login_conditions(&user).is_ok());
        user.expiration_date = 0;
        assert!(check_login_conditions(&user).is_ok());
    }

    #[test]
    fn password_verification_is_uniform_on_mismatch() {
        let mut user = enabled_user();
        user.password = common_passhash::hash_password("right").expect("hash");
        let verified = verify_user_password(user.clone(), "right").expect("verify");
        assert_eq!(verified.username, "alice");
        assert!(matches!(
            verify_user_password(user.clone(), "wrong"),
            Err(ProviderError::InvalidCredentials)
        ));
        user.password.clear();
        assert!(matches!(
            verify_user_password(user, "right"),
            Err(ProviderError::InvalidCredentials)
        ));
    }
}
