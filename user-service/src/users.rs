use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::config::Operation;
use crate::error::ProviderError;

pub const PERM_ANY: &str = "*";
pub const PERM_LIST: &str = "list";
pub const PERM_DOWNLOAD: &str = "download";
pub const PERM_UPLOAD: &str = "upload";
pub const PERM_OVERWRITE: &str = "overwrite";
pub const PERM_RENAME: &str = "rename";
pub const PERM_DELETE: &str = "delete";
pub const PERM_CREATE_DIRS: &str = "create-dirs";
pub const PERM_CREATE_SYMLINKS: &str = "create-symlinks";
pub const PERM_CHMOD: &str = "chmod";
pub const PERM_CHOWN: &str = "chown";
pub const PERM_CHTIMES: &str = "chtimes";

/// Every permission token a user can be granted for a virtual path.
pub const VALID_PERMS: &[&str] = &[
    PERM_ANY,
    PERM_LIST,
    PERM_DOWNLOAD,
    PERM_UPLOAD,
    PERM_OVERWRITE,
    PERM_RENAME,
    PERM_DELETE,
    PERM_CREATE_DIRS,
    PERM_CREATE_SYMLINKS,
    PERM_CHMOD,
    PERM_CHOWN,
    PERM_CHTIMES,
];

pub const USER_STATUS_DISABLED: i32 = 0;
pub const USER_STATUS_ENABLED: i32 = 1;

pub const FS_PROVIDER_LOCAL: i32 = 0;
pub const FS_PROVIDER_S3: i32 = 1;
pub const FS_PROVIDER_GCS: i32 = 2;

/// S3 access secret across its lifecycle: set as plaintext, persisted as an
/// encrypted envelope, exposed externally with the envelope key stripped.
/// Serialized as its plain string form everywhere (JSON, SQL column), so the
/// classification is re-derived on load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AccessSecret {
    #[default]
    Empty,
    Plaintext(String),
    Encrypted(String),
    Redacted(String),
}

impl AccessSecret {
    pub fn from_string(value: String) -> Self {
        if value.is_empty() {
            AccessSecret::Empty
        } else if common_crypto::is_envelope(&value) {
            if common_crypto::has_decryption_key(&value) {
                AccessSecret::Encrypted(value)
            } else {
                AccessSecret::Redacted(value)
            }
        } else {
            AccessSecret::Plaintext(value)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AccessSecret::Empty => "",
            AccessSecret::Plaintext(value)
            | AccessSecret::Encrypted(value)
            | AccessSecret::Redacted(value) => value,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, AccessSecret::Empty)
    }

    /// Move a plaintext secret into envelope form; already-encrypted and
    /// redacted secrets are left untouched.
    pub fn encrypt_in_place(&mut self) -> Result<(), ProviderError> {
        if let AccessSecret::Plaintext(value) = self {
            *self = AccessSecret::Encrypted(common_crypto::encrypt(value)?);
        }
        Ok(())
    }

    /// Strip the decryption key for external exposure. Idempotent.
    pub fn redact_in_place(&mut self) {
        if let AccessSecret::Encrypted(value) = self {
            *self = AccessSecret::Redacted(common_crypto::remove_decryption_key(value));
        }
    }
}

impl Serialize for AccessSecret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for AccessSecret {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(AccessSecret::from_string(String::deserialize(deserializer)?))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct S3FsConfig {
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub access_secret: AccessSecret,
    #[serde(default)]
    pub endpoint: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcsFsConfig {
    #[serde(default)]
    pub bucket: String,
    /// Base64 service-account JSON, present in the record only at
    /// import/export time. Validation writes it to the per-user credentials
    /// file and clears this field.
    #[serde(default)]
    pub credentials: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// 0 local, 1 S3, 2 GCS. Anything else is reset to local.
    #[serde(default)]
    pub provider: i32,
    #[serde(default)]
    pub s3_config: S3FsConfig,
    #[serde(default)]
    pub gcs_config: GcsFsConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserFilters {
    /// Client networks allowed to log in, CIDR notation. Empty allows any.
    #[serde(default)]
    pub allowed_ip: Vec<String>,
    /// Client networks refused before authentication.
    #[serde(default)]
    pub denied_ip: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Store-assigned identifier.
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub username: String,
    /// Empty, or a hash carrying one of the recognized family prefixes.
    #[serde(default)]
    pub password: String,
    /// OpenSSH authorized-key lines.
    #[serde(default)]
    pub public_keys: Vec<String>,
    #[serde(default)]
    pub home_dir: String,
    /// 0 disabled, 1 enabled.
    #[serde(default)]
    pub status: i32,
    /// Epoch milliseconds, 0 = never expires.
    #[serde(default)]
    pub expiration_date: i64,
    /// Absolute virtual path -> granted permission tokens. Must contain "/".
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub filters: UserFilters,
    #[serde(default)]
    pub fs_config: FilesystemConfig,
    /// Quota limits; 0 means unrestricted.
    #[serde(default)]
    pub quota_size: i64,
    #[serde(default)]
    pub quota_files: i32,
    #[serde(default)]
    pub used_quota_size: i64,
    #[serde(default)]
    pub used_quota_files: i32,
    /// Epoch milliseconds of the last quota counter change.
    #[serde(default)]
    pub last_quota_update: i64,
    /// Epoch milliseconds of the last successful login.
    #[serde(default)]
    pub last_login: i64,
}

impl User {
    pub fn has_quota_restrictions(&self) -> bool {
        self.quota_files > 0 || self.quota_size > 0
    }

    pub fn gcs_credentials_file_path(&self, credentials_dir: &Path) -> PathBuf {
        credentials_dir.join(format!("{}_gcs_credentials.json", self.username))
    }

    /// Scrub the record for exposure outside the trust boundary: the
    /// password hash is cleared, the S3 secret keeps only its ciphertext
    /// body, the GCS credential blob is dropped entirely. Idempotent.
    pub fn hide_sensitive_data(&mut self) {
        self.password.clear();
        match self.fs_config.provider {
            FS_PROVIDER_S3 => self.fs_config.s3_config.access_secret.redact_in_place(),
            FS_PROVIDER_GCS => self.fs_config.gcs_config.credentials.clear(),
            _ => {}
        }
    }

    pub(crate) fn notification_args(&self, operation: Operation) -> Vec<String> {
        vec![
            operation.as_str().to_string(),
            self.id.to_string(),
            self.username.clone(),
            self.home_dir.clone(),
            self.status.to_string(),
            self.expiration_date.to_string(),
        ]
    }

    pub(crate) fn notification_env(&self, operation: Operation) -> Vec<(&'static str, String)> {
        vec![
            ("SFTPD_ACTION", operation.as_str().to_string()),
            ("SFTPD_ACTION_USER_ID", self.id.to_string()),
            ("SFTPD_ACTION_USERNAME", self.username.clone()),
            ("SFTPD_ACTION_HOME_DIR", self.home_dir.clone()),
            ("SFTPD_ACTION_STATUS", self.status.to_string()),
            (
                "SFTPD_ACTION_EXPIRATION_DATE",
                self.expiration_date.to_string(),
            ),
        ]
    }
}

/// Current time as epoch milliseconds, the timestamp unit user records use.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Context the validation pipeline needs beyond the record itself.
#[derive(Debug, Clone, Default)]
pub struct ValidationSettings {
    /// Default parent for home dirs of users created without one; empty
    /// disables the fallback.
    pub users_base_dir: String,
    /// Directory holding per-user credential files.
    pub credentials_dir: PathBuf,
}

/// Normalize and validate a user record before it is persisted. Runs the
/// steps in a fixed order and stops at the first failure.
pub fn validate_user(user: &mut User, settings: &ValidationSettings) -> Result<(), ProviderError> {
    build_home_dir(user, settings);
    validate_base_params(user)?;
    validate_permissions(user)?;
    validate_filesystem_config(user, settings)?;
    if !(USER_STATUS_DISABLED..=USER_STATUS_ENABLED).contains(&user.status) {
        return Err(ProviderError::validation(format!(
            "invalid user status: {}",
            user.status
        )));
    }
    if !user.password.is_empty() && !common_passhash::is_hashed(&user.password) {
        user.password = common_passhash::hash_password(&user.password)?;
    }
    validate_public_keys(user)?;
    validate_filters(user)?;
    Ok(())
}

fn build_home_dir(user: &mut User, settings: &ValidationSettings) {
    if user.home_dir.is_empty() && !settings.users_base_dir.is_empty() {
        user.home_dir = Path::new(&settings.users_base_dir)
            .join(&user.username)
            .to_string_lossy()
            .into_owned();
    }
}

fn validate_base_params(user: &User) -> Result<(), ProviderError> {
    if user.username.is_empty() || user.home_dir.is_empty() {
        return Err(ProviderError::validation("mandatory parameters missing"));
    }
    if user.password.is_empty() && user.public_keys.is_empty() {
        return Err(ProviderError::validation(
            "please set a password or at least a public key",
        ));
    }
    if !Path::new(&user.home_dir).is_absolute() {
        return Err(ProviderError::validation(format!(
            "home_dir must be an absolute path, actual value: {}",
            user.home_dir
        )));
    }
    Ok(())
}

fn validate_permissions(user: &mut User) -> Result<(), ProviderError> {
    if user.permissions.is_empty() {
        return Err(ProviderError::validation(
            "please grant some permissions to this user",
        ));
    }
    if !user.permissions.contains_key("/") {
        return Err(ProviderError::validation(
            "permissions for the root dir \"/\" must be set",
        ));
    }
    let mut normalized = HashMap::with_capacity(user.permissions.len());
    for (dir, perms) in &user.permissions {
        if perms.is_empty() {
            return Err(ProviderError::validation(format!(
                "no permissions granted for the directory: {dir}"
            )));
        }
        for perm in perms {
            if !VALID_PERMS.contains(&perm.as_str()) {
                return Err(ProviderError::validation(format!(
                    "invalid permission: {perm}"
                )));
            }
        }
        let cleaned = clean_virtual_path(dir);
        if !cleaned.starts_with('/') {
            return Err(ProviderError::validation(format!(
                "cannot set permissions for non absolute path: {dir}"
            )));
        }
        if perms.iter().any(|p| p == PERM_ANY) {
            normalized.insert(cleaned, vec![PERM_ANY.to_string()]);
        } else {
            normalized.insert(cleaned, perms.clone());
        }
    }
    user.permissions = normalized;
    Ok(())
}

// Slash-normalize a virtual path, collapse `.`/`..` segments, and strip any
// trailing slash (the root stays "/"). Relative inputs stay relative so the
// caller can reject them.
fn clean_virtual_path(input: &str) -> String {
    let normalized = input.replace('\\', "/");
    let absolute = normalized.starts_with('/');
    let mut segments: Vec<&str> = Vec::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    if absolute {
        format!("/{}", segments.join("/"))
    } else {
        segments.join("/")
    }
}

fn validate_filesystem_config(
    user: &mut User,
    settings: &ValidationSettings,
) -> Result<(), ProviderError> {
    match user.fs_config.provider {
        FS_PROVIDER_S3 => {
            let s3 = &mut user.fs_config.s3_config;
            if s3.bucket.is_empty() {
                return Err(ProviderError::validation("s3: bucket cannot be empty"));
            }
            if s3.region.is_empty() {
                return Err(ProviderError::validation("s3: region cannot be empty"));
            }
            if s3.access_key.is_empty() || s3.access_secret.is_empty() {
                return Err(ProviderError::validation(
                    "s3: credentials cannot be empty",
                ));
            }
            s3.access_secret.encrypt_in_place()?;
            Ok(())
        }
        FS_PROVIDER_GCS => {
            if user.fs_config.gcs_config.bucket.is_empty() {
                return Err(ProviderError::validation("gcs: bucket cannot be empty"));
            }
            let credentials_file = user.gcs_credentials_file_path(&settings.credentials_dir);
            if user.fs_config.gcs_config.credentials.is_empty() {
                if !credentials_file.exists() {
                    return Err(ProviderError::validation(
                        "gcs: credentials cannot be empty",
                    ));
                }
                return Ok(());
            }
            save_gcs_credentials(user, &credentials_file)
        }
        FS_PROVIDER_LOCAL => Ok(()),
        _ => {
            user.fs_config = FilesystemConfig::default();
            Ok(())
        }
    }
}

fn save_gcs_credentials(user: &mut User, credentials_file: &Path) -> Result<(), ProviderError> {
    let decoded = BASE64_STANDARD
        .decode(&user.fs_config.gcs_config.credentials)
        .map_err(|err| {
            ProviderError::validation(format!("could not validate GCS credentials: {err}"))
        })?;
    std::fs::write(credentials_file, decoded).map_err(|err| {
        ProviderError::validation(format!("could not save GCS credentials: {err}"))
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(credentials_file, std::fs::Permissions::from_mode(0o600))
            .map_err(|err| {
                ProviderError::validation(format!("could not save GCS credentials: {err}"))
            })?;
    }
    user.fs_config.gcs_config.credentials.clear();
    Ok(())
}

/// Re-embed the on-disk GCS credential file as a base64 blob, for backup
/// export of a record.
pub(crate) fn load_gcs_credentials(
    user: &mut User,
    settings: &ValidationSettings,
) -> Result<(), ProviderError> {
    if user.fs_config.provider != FS_PROVIDER_GCS {
        return Ok(());
    }
    let credentials = std::fs::read(user.gcs_credentials_file_path(&settings.credentials_dir))?;
    user.fs_config.gcs_config.credentials = BASE64_STANDARD.encode(credentials);
    Ok(())
}

fn validate_public_keys(user: &User) -> Result<(), ProviderError> {
    for (idx, key) in user.public_keys.iter().enumerate() {
        ssh_key::PublicKey::from_openssh(key).map_err(|err| {
            ProviderError::validation(format!("could not parse key nr. {idx}: {err}"))
        })?;
    }
    Ok(())
}

fn validate_filters(user: &mut User) -> Result<(), ProviderError> {
    for mask in &user.filters.denied_ip {
        mask.parse::<ipnet::IpNet>().map_err(|err| {
            ProviderError::validation(format!("could not parse denied IP/mask {mask:?}: {err}"))
        })?;
    }
    for mask in &user.filters.allowed_ip {
        mask.parse::<ipnet::IpNet>().map_err(|err| {
            ProviderError::validation(format!("could not parse allowed IP/mask {mask:?}: {err}"))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_user() -> User {
        User {
            username: "alice".to_string(),
            password: "s3cr3t".to_string(),
            home_dir: "/srv/sftp/alice".to_string(),
            status: USER_STATUS_ENABLED,
            permissions: HashMap::from([("/".to_string(), vec![PERM_ANY.to_string()])]),
            ..User::default()
        }
    }

    #[test]
    fn plaintext_password_is_rehashed() {
        let mut user = valid_user();
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        assert!(user.password.starts_with("$argon2id$"));
    }

    #[test]
    fn recognized_hashes_are_kept_verbatim() {
        let mut user = valid_user();
        user.password = "$6$salt$hash".to_string();
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        assert_eq!(user.password, "$6$salt$hash");
    }

    #[test]
    fn home_dir_defaults_under_base_dir() {
        let mut user = valid_user();
        user.home_dir.clear();
        let settings = ValidationSettings {
            users_base_dir: "/srv/sftp".to_string(),
            ..ValidationSettings::default()
        };
        validate_user(&mut user, &settings).expect("validate");
        assert_eq!(user.home_dir, "/srv/sftp/alice");
    }

    #[test]
    fn missing_credentials_are_rejected() {
        let mut user = valid_user();
        user.password.clear();
        let err = validate_user(&mut user, &ValidationSettings::default()).unwrap_err();
        assert!(matches!(err, ProviderError::Validation(_)));
    }

    #[test]
    fn relative_home_dir_is_rejected() {
        let mut user = valid_user();
        user.home_dir = "srv/sftp/alice".to_string();
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
    }

    #[test]
    fn permissions_require_root_entry() {
        let mut user = valid_user();
        user.permissions =
            HashMap::from([("/uploads".to_string(), vec![PERM_UPLOAD.to_string()])]);
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
    }

    #[test]
    fn permission_paths_are_normalized_and_any_collapses() {
        let mut user = valid_user();
        user.permissions.insert(
            "/uploads/../in/".to_string(),
            vec![PERM_UPLOAD.to_string(), PERM_ANY.to_string()],
        );
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        assert_eq!(
            user.permissions.get("/in"),
            Some(&vec![PERM_ANY.to_string()])
        );
        assert!(!user.permissions.contains_key("/uploads/../in/"));
    }

    #[test]
    fn invalid_permission_token_is_rejected() {
        let mut user = valid_user();
        user.permissions
            .insert("/data".to_string(), vec!["fly".to_string()]);
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
    }

    #[test]
    fn invalid_status_is_rejected() {
        let mut user = valid_user();
        user.status = 2;
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
    }

    #[test]
    fn invalid_cidr_filters_are_rejected() {
        let mut user = valid_user();
        user.filters.denied_ip = vec!["10.0.0.1".to_string()];
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
        user.filters.denied_ip = vec!["10.0.0.0/8".to_string()];
        user.filters.allowed_ip = vec!["2001:db8::/32".to_string()];
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
    }

    #[test]
    fn invalid_public_key_is_rejected() {
        let mut user = valid_user();
        user.public_keys = vec!["ssh-ed25519 not-a-key".to_string()];
        assert!(validate_user(&mut user, &ValidationSettings::default()).is_err());
    }

    #[test]
    fn unknown_fs_provider_resets_to_local() {
        let mut user = valid_user();
        user.fs_config.provider = 9;
        user.fs_config.s3_config.bucket = "leftover".to_string();
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        assert_eq!(user.fs_config.provider, FS_PROVIDER_LOCAL);
        assert!(user.fs_config.s3_config.bucket.is_empty());
    }

    #[test]
    fn s3_secret_is_encrypted_on_validation() {
        let mut user = valid_user();
        user.fs_config.provider = FS_PROVIDER_S3;
        user.fs_config.s3_config = S3FsConfig {
            bucket: "backups".to_string(),
            region: "us-east-1".to_string(),
            access_key: "AKIA123".to_string(),
            access_secret: AccessSecret::Plaintext("hunter2".to_string()),
            endpoint: String::new(),
        };
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        match &user.fs_config.s3_config.access_secret {
            AccessSecret::Encrypted(value) => {
                assert_eq!(common_crypto::decrypt(value).expect("decrypt"), "hunter2");
            }
            other => panic!("expected encrypted secret, got {other:?}"),
        }
    }

    #[test]
    fn hide_sensitive_data_is_idempotent() {
        let mut user = valid_user();
        user.fs_config.provider = FS_PROVIDER_S3;
        user.fs_config.s3_config = S3FsConfig {
            bucket: "backups".to_string(),
            region: "us-east-1".to_string(),
            access_key: "AKIA123".to_string(),
            access_secret: AccessSecret::Plaintext("hunter2".to_string()),
            endpoint: String::new(),
        };
        validate_user(&mut user, &ValidationSettings::default()).expect("validate");
        user.hide_sensitive_data();
        let once = user.clone();
        assert!(once.password.is_empty());
        assert!(matches!(
            once.fs_config.s3_config.access_secret,
            AccessSecret::Redacted(_)
        ));
        user.hide_sensitive_data();
        assert_eq!(user, once);
    }

    #[test]
    fn access_secret_serde_round_trip() {
        let secret = AccessSecret::from_string(common_crypto::encrypt("pw").expect("encrypt"));
        let json = serde_json::to_string(&secret).expect("serialize");
        let back: AccessSecret = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(secret, back);
        assert!(matches!(back, AccessSecret::Encrypted(_)));
    }

    #[test]
    fn clean_virtual_path_handles_edge_cases() {
        assert_eq!(clean_virtual_path("/"), "/");
        assert_eq!(clean_virtual_path("/a/b/"), "/a/b");
        assert_eq!(clean_virtual_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_virtual_path("a/b"), "a/b");
        assert_eq!(clean_virtual_path("\\win\\style"), "/win/style");
    }
}
