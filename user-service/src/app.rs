use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::{resolve_credentials_dir, Driver, ProviderConfig};
use crate::error::ProviderError;
use crate::metrics::ProviderMetrics;
use crate::monitor;
use crate::quota::ScanTracker;
use crate::store::{MemoryStore, SledStore, SqlStore, UserStore};
use crate::users::ValidationSettings;

/// Everything the request handlers need, built once at startup. All fields
/// are immutable after initialization except the scan tracker, which guards
/// its own state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn UserStore>,
    pub config: Arc<ProviderConfig>,
    pub validation: Arc<ValidationSettings>,
    pub http_client: reqwest::Client,
    pub metrics: Arc<ProviderMetrics>,
    pub scans: Arc<ScanTracker>,
    shutdown: watch::Sender<bool>,
    monitor: Arc<tokio::sync::Mutex<Option<JoinHandle<()>>>>,
}

impl AppState {
    /// Validate the configuration, connect the selected backend, run the
    /// initial availability probe and start the periodic monitor.
    pub async fn initialize(config: ProviderConfig, config_dir: &Path) -> anyhow::Result<Self> {
        if !config.external_auth_program.is_empty() {
            let program = Path::new(&config.external_auth_program);
            if !program.is_absolute() {
                bail!(
                    "invalid external auth program: {:?} must be an absolute path",
                    config.external_auth_program
                );
            }
            std::fs::metadata(program).with_context(|| {
                format!(
                    "invalid external auth program {:?}",
                    config.external_auth_program
                )
            })?;
        }

        let credentials_dir = resolve_credentials_dir(&config, config_dir);
        ensure_credentials_dir(&credentials_dir)?;
        let validation = Arc::new(ValidationSettings {
            users_base_dir: config.users_base_dir.clone(),
            credentials_dir,
        });

        let store = build_store(&config, config_dir, &validation).await?;
        info!(driver = config.driver.as_str(), "user store connected");

        let metrics = Arc::new(ProviderMetrics::new()?);
        monitor::probe(store.as_ref(), &metrics).await;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle =
            monitor::spawn_availability_monitor(store.clone(), metrics.clone(), shutdown_rx);

        Ok(Self {
            store,
            config: Arc::new(config),
            validation,
            http_client: reqwest::Client::new(),
            metrics,
            scans: Arc::new(ScanTracker::default()),
            shutdown,
            monitor: Arc::new(tokio::sync::Mutex::new(Some(handle))),
        })
    }

    /// Stop the availability monitor and release the store.
    pub async fn close(&self) -> Result<(), ProviderError> {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.monitor.lock().await.take() {
            let _ = handle.await;
        }
        self.store.close().await
    }
}

async fn build_store(
    config: &ProviderConfig,
    config_dir: &Path,
    validation: &Arc<ValidationSettings>,
) -> anyhow::Result<Arc<dyn UserStore>> {
    match config.driver {
        Driver::Sqlite => {
            let path = config.database_path(config_dir);
            let url = format!("sqlite://{}?mode=rwc", path.display());
            let store =
                SqlStore::connect(config.driver, &url, config.pool_size, &config.users_table)
                    .await?;
            Ok(Arc::new(store))
        }
        Driver::Postgresql | Driver::Mysql => {
            let url = config.sql_connection_url();
            let store =
                SqlStore::connect(config.driver, &url, config.pool_size, &config.users_table)
                    .await?;
            Ok(Arc::new(store))
        }
        Driver::Bolt => {
            let store = SledStore::open(&config.database_path(config_dir))?;
            Ok(Arc::new(store))
        }
        Driver::Memory => {
            let users_file = if config.name.is_empty() {
                None
            } else {
                Some(config.database_path(config_dir))
            };
            let load_on_start = matches!(&users_file, Some(path) if path.exists());
            let store = Arc::new(MemoryStore::new(users_file, validation.as_ref().clone()));
            if load_on_start {
                store.reload_config().await?;
            }
            Ok(store)
        }
    }
}

fn ensure_credentials_dir(credentials_dir: &Path) -> anyhow::Result<()> {
    match std::fs::metadata(credentials_dir) {
        Ok(metadata) => {
            if !metadata.is_dir() {
                bail!(
                    "credentials path {} is not a valid directory",
                    credentials_dir.display()
                );
            }
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(credentials_dir).with_context(|| {
                format!(
                    "could not create credentials dir {}",
                    credentials_dir.display()
                )
            })?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(credentials_dir, std::fs::Permissions::from_mode(0o700))?;
            }
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
