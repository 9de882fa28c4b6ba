use thiserror::Error;

pub(crate) const MANAGE_USERS_DISABLED: &str =
    "please set manage_users to 1 in your configuration to enable this method";
pub(crate) const TRACK_QUOTA_DISABLED: &str =
    "please enable track_quota in your configuration to use this method";

/// Error taxonomy for the user store and the auth pipeline. Authentication
/// failures are deliberately uniform: callers (and remote clients) see
/// `InvalidCredentials` whether the password was wrong, the account is
/// disabled, or it has expired. The precise cause is only logged.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("method disabled: {0}")]
    MethodDisabled(&'static str),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("key/value store error: {0}")]
    Kv(#[from] sled::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("external auth error: {0}")]
    ExternalAuth(String),
    #[error("password hash error: {0}")]
    PasswordHash(#[from] common_passhash::PasswordHashError),
    #[error("secret encryption error: {0}")]
    Crypto(#[from] common_crypto::CryptoError),
}

impl ProviderError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}
