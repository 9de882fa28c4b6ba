use anyhow::{anyhow, Context, Result};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Storage backend for user records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Driver {
    Sqlite,
    Postgresql,
    Mysql,
    /// Embedded key/value store (single file directory, no server).
    Bolt,
    Memory,
}

impl Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Driver::Sqlite => "sqlite",
            Driver::Postgresql => "postgresql",
            Driver::Mysql => "mysql",
            Driver::Bolt => "bolt",
            Driver::Memory => "memory",
        }
    }
}

impl FromStr for Driver {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Driver::Sqlite),
            "postgresql" => Ok(Driver::Postgresql),
            "mysql" => Ok(Driver::Mysql),
            "bolt" => Ok(Driver::Bolt),
            "memory" => Ok(Driver::Memory),
            other => Err(anyhow!(
                "unsupported driver '{other}'. Use sqlite, postgresql, mysql, bolt, or memory."
            )),
        }
    }
}

/// Administrative operation a notification can be fired for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "add" => Ok(Operation::Add),
            "update" => Ok(Operation::Update),
            "delete" => Ok(Operation::Delete),
            other => Err(anyhow!(
                "unsupported action operation '{other}'. Use add, update, or delete."
            )),
        }
    }
}

/// Side effects to run after administrative user mutations.
#[derive(Debug, Clone, Default)]
pub struct ActionsConfig {
    /// Operations the side effects fire for; empty disables everything.
    pub execute_on: Vec<Operation>,
    /// Absolute path of a command to execute, empty to disable.
    pub command: String,
    /// URL to POST the scrubbed user to, empty to disable. The operation is
    /// appended to the query string as `action=<op>`.
    pub http_notification_url: String,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub driver: Driver,
    /// Database name; for sqlite/bolt/memory a file path, relative to the
    /// config dir or absolute.
    pub name: String,
    pub host: String,
    /// 0 picks the driver default (5432 / 3306).
    pub port: u16,
    pub username: String,
    pub password: String,
    /// 0 disable, 1 require, 2 verify-ca (postgresql) / skip-verify (mysql),
    /// 3 verify-full (postgresql) / preferred (mysql).
    pub sslmode: u8,
    /// Overrides every other connection parameter when non-empty.
    pub connection_string: String,
    pub users_table: String,
    /// 0 disables every mutating management operation.
    pub manage_users: u8,
    /// 0 disabled, 1 track always, 2 track only users with quota limits
    /// (scans with reset still go through).
    pub track_quota: u8,
    /// Max pooled connections for the networked SQL drivers, 0 = unlimited.
    pub pool_size: u32,
    /// Default parent for home dirs of users created without one.
    pub users_base_dir: String,
    pub actions: ActionsConfig,
    /// Absolute path of an external authentication program, empty to use
    /// the built-in store checks.
    pub external_auth_program: String,
    /// Bitmask: 0 = every method, 1 password, 2 public key, 4 keyboard
    /// interactive; combinable.
    pub external_auth_scope: u8,
    /// Directory for per-user credential files (e.g. GCS service account
    /// keys), relative to the config dir or absolute.
    pub credentials_path: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            driver: Driver::Sqlite,
            name: "users.db".to_string(),
            host: String::new(),
            port: 0,
            username: String::new(),
            password: String::new(),
            sslmode: 0,
            connection_string: String::new(),
            users_table: "users".to_string(),
            manage_users: 1,
            track_quota: 2,
            pool_size: 0,
            users_base_dir: String::new(),
            actions: ActionsConfig::default(),
            external_auth_program: String::new(),
            external_auth_scope: 0,
            credentials_path: "credentials".to_string(),
        }
    }
}

impl ProviderConfig {
    pub fn external_auth_enabled_for(&self, scope_bit: u8) -> bool {
        !self.external_auth_program.is_empty()
            && (self.external_auth_scope == 0 || self.external_auth_scope & scope_bit != 0)
    }

    pub fn password_auth_is_external(&self) -> bool {
        self.external_auth_enabled_for(1)
    }

    pub fn public_key_auth_is_external(&self) -> bool {
        self.external_auth_enabled_for(2)
    }

    pub fn keyboard_auth_is_external(&self) -> bool {
        self.external_auth_enabled_for(4)
    }

    /// Connection URL for the networked SQL drivers. sslmode integers map to
    /// the closest option each driver supports.
    pub(crate) fn sql_connection_url(&self) -> String {
        if !self.connection_string.is_empty() {
            return self.connection_string.clone();
        }
        match self.driver {
            Driver::Postgresql => {
                let port = if self.port > 0 { self.port } else { 5432 };
                let sslmode = match self.sslmode {
                    1 => "require",
                    2 => "verify-ca",
                    3 => "verify-full",
                    _ => "disable",
                };
                format!(
                    "postgres://{}:{}@{}:{}/{}?sslmode={}",
                    self.username, self.password, self.host, port, self.name, sslmode
                )
            }
            Driver::Mysql => {
                let port = if self.port > 0 { self.port } else { 3306 };
                let sslmode = match self.sslmode {
                    1 => "VERIFY_CA",
                    2 => "REQUIRED",
                    3 => "PREFERRED",
                    _ => "DISABLED",
                };
                format!(
                    "mysql://{}:{}@{}:{}/{}?ssl-mode={}",
                    self.username, self.password, self.host, port, self.name, sslmode
                )
            }
            _ => String::new(),
        }
    }

    /// File path for the embedded backends, relative to the config dir
    /// unless absolute.
    pub(crate) fn database_path(&self, config_dir: &Path) -> PathBuf {
        let name = Path::new(&self.name);
        if name.is_absolute() {
            name.to_path_buf()
        } else {
            config_dir.join(name)
        }
    }
}

/// Directory for per-user credential files, relative to the config dir
/// unless absolute.
pub fn resolve_credentials_dir(config: &ProviderConfig, config_dir: &Path) -> PathBuf {
    let path = Path::new(&config.credentials_path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_dir.join(path)
    }
}

/// Load the provider configuration from `SFTPD_*` environment variables.
/// Every option has a default; parse failures and out-of-range values fail
/// startup instead of being silently clamped.
pub fn load_provider_config() -> Result<ProviderConfig> {
    let defaults = ProviderConfig::default();

    let driver = match env::var("SFTPD_DRIVER") {
        Ok(value) => value.parse::<Driver>()?,
        Err(_) => defaults.driver,
    };

    let manage_users = env_ranged_u8("SFTPD_MANAGE_USERS", defaults.manage_users, 1)?;
    let track_quota = env_ranged_u8("SFTPD_TRACK_QUOTA", defaults.track_quota, 2)?;
    let sslmode = env_ranged_u8("SFTPD_SSLMODE", defaults.sslmode, 3)?;
    let external_auth_scope =
        env_ranged_u8("SFTPD_EXTERNAL_AUTH_SCOPE", defaults.external_auth_scope, 7)?;

    let execute_on = env::var("SFTPD_ACTIONS_EXECUTE_ON")
        .ok()
        .map(|value| parse_operations(&value))
        .transpose()
        .context("Failed to parse SFTPD_ACTIONS_EXECUTE_ON")?
        .unwrap_or_default();

    Ok(ProviderConfig {
        driver,
        name: env_string("SFTPD_NAME", &defaults.name),
        host: env_string("SFTPD_HOST", &defaults.host),
        port: env_parse("SFTPD_PORT")?.unwrap_or(defaults.port),
        username: env_string("SFTPD_USERNAME", &defaults.username),
        password: env_string("SFTPD_PASSWORD", &defaults.password),
        sslmode,
        connection_string: env_string("SFTPD_CONNECTION_STRING", &defaults.connection_string),
        users_table: env_string("SFTPD_USERS_TABLE", &defaults.users_table),
        manage_users,
        track_quota,
        pool_size: env_parse("SFTPD_POOL_SIZE")?.unwrap_or(defaults.pool_size),
        users_base_dir: env_string("SFTPD_USERS_BASE_DIR", &defaults.users_base_dir),
        actions: ActionsConfig {
            execute_on,
            command: env_string("SFTPD_ACTIONS_COMMAND", ""),
            http_notification_url: env_string("SFTPD_ACTIONS_HTTP_NOTIFICATION_URL", ""),
        },
        external_auth_program: env_string("SFTPD_EXTERNAL_AUTH_PROGRAM", ""),
        external_auth_scope,
        credentials_path: env_string("SFTPD_CREDENTIALS_PATH", &defaults.credentials_path),
    })
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|err| anyhow!("Invalid {key} '{value}': {err}")),
        Err(_) => Ok(None),
    }
}

fn env_ranged_u8(key: &str, default: u8, max: u8) -> Result<u8> {
    let value = env_parse::<u8>(key)?.unwrap_or(default);
    if value > max {
        return Err(anyhow!("Invalid {key}: {value} is out of range 0..={max}"));
    }
    Ok(value)
}

fn parse_operations(value: &str) -> Result<Vec<Operation>> {
    let mut operations = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let operation = item.parse::<Operation>()?;
        if !operations.contains(&operation) {
            operations.push(operation);
        }
    }
    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_parsing() {
        assert_eq!("PostgreSQL".parse::<Driver>().unwrap(), Driver::Postgresql);
        assert_eq!("bolt".parse::<Driver>().unwrap(), Driver::Bolt);
        assert!("mongodb".parse::<Driver>().is_err());
    }

    #[test]
    fn operations_parse_and_dedupe() {
        let parsed = parse_operations("add, update,add,").unwrap();
        assert_eq!(parsed, vec![Operation::Add, Operation::Update]);
        assert!(parse_operations("add,drop").is_err());
    }

    #[test]
    fn external_auth_scope_bits() {
        let mut config = ProviderConfig {
            external_auth_program: "/usr/local/bin/authd".to_string(),
            external_auth_scope: 2,
            ..ProviderConfig::default()
        };
        assert!(!config.password_auth_is_external());
        assert!(config.public_key_auth_is_external());
        assert!(!config.keyboard_auth_is_external());

        config.external_auth_scope = 0;
        assert!(config.password_auth_is_external());
        assert!(config.public_key_auth_is_external());
        assert!(config.keyboard_auth_is_external());

        config.external_auth_program.clear();
        assert!(!config.password_auth_is_external());
    }

    #[test]
    fn postgres_url_maps_sslmode() {
        let config = ProviderConfig {
            driver: Driver::Postgresql,
            name: "sftp".to_string(),
            host: "db.internal".to_string(),
            username: "svc".to_string(),
            password: "pw".to_string(),
            sslmode: 2,
            ..ProviderConfig::default()
        };
        assert_eq!(
            config.sql_connection_url(),
            "postgres://svc:pw@db.internal:5432/sftp?sslmode=verify-ca"
        );
    }

    #[test]
    fn connection_string_overrides_parameters() {
        let config = ProviderConfig {
            driver: Driver::Mysql,
            host: "ignored".to_string(),
            connection_string: "mysql://u:p@example:3307/users".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(config.sql_connection_url(), "mysql://u:p@example:3307/users");
    }

    #[test]
    fn database_path_resolution() {
        let config = ProviderConfig::default();
        assert_eq!(
            config.database_path(Path::new("/etc/sftpd")),
            PathBuf::from("/etc/sftpd/users.db")
        );
        let absolute = ProviderConfig {
            name: "/var/lib/sftpd/users.db".to_string(),
            ..ProviderConfig::default()
        };
        assert_eq!(
            absolute.database_path(Path::new("/etc/sftpd")),
            PathBuf::from("/var/lib/sftpd/users.db")
        );
    }

    #[test]
    fn env_overrides_are_applied() {
        env::set_var("SFTPD_TRACK_QUOTA", "1");
        env::set_var("SFTPD_ACTIONS_EXECUTE_ON", "add,delete");
        let config = load_provider_config().unwrap();
        assert_eq!(config.track_quota, 1);
        assert_eq!(
            config.actions.execute_on,
            vec![Operation::Add, Operation::Delete]
        );
        env::remove_var("SFTPD_TRACK_QUOTA");
        env::remove_var("SFTPD_ACTIONS_EXECUTE_ON");
    }
}
