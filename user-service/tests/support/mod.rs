#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use tempfile::TempDir;
use user_service::app::AppState;
use user_service::config::{Driver, ProviderConfig};
use user_service::users::{User, PERM_ANY, USER_STATUS_ENABLED};

/// Test fixture from the ssh-key crate documentation.
pub const ED25519_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILM+rvN+ot98qgEN796jTiQfZfG1KaT0PtFDJ13gEiGB user@example.com";

pub struct TestProvider {
    pub state: AppState,
    /// Keeps the config/credentials/database directory alive for the test.
    pub dir: TempDir,
}

pub fn base_config(driver: Driver) -> ProviderConfig {
    let mut config = ProviderConfig {
        driver,
        manage_users: 1,
        track_quota: 1,
        ..ProviderConfig::default()
    };
    if driver == Driver::Memory {
        config.name = String::new();
    }
    config
}

pub async fn build_state(config: ProviderConfig) -> Result<TestProvider> {
    let dir = TempDir::new()?;
    build_state_in(config, dir).await
}

pub async fn build_state_in(config: ProviderConfig, dir: TempDir) -> Result<TestProvider> {
    let state = AppState::initialize(config, dir.path()).await?;
    Ok(TestProvider { state, dir })
}

pub async fn memory_provider() -> Result<TestProvider> {
    build_state(base_config(Driver::Memory)).await
}

pub fn test_user(username: &str, home_dir: &Path) -> User {
    User {
        username: username.to_string(),
        password: "s3cr3t".to_string(),
        home_dir: home_dir.to_string_lossy().into_owned(),
        status: USER_STATUS_ENABLED,
        permissions: HashMap::from([("/".to_string(), vec![PERM_ANY.to_string()])]),
        ..User::default()
    }
}

#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, content: &str) -> Result<std::path::PathBuf> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, content)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    Ok(path)
}
