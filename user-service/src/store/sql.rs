use async_trait::async_trait;
use serde::de::DeserializeOwned;
use sqlx::any::{AnyPool, AnyPoolOptions, AnyRow};
use sqlx::Row;
use tracing::debug;

use crate::config::Driver;
use crate::error::ProviderError;
use crate::store::{ListOrder, UserStore};
use crate::users::{now_ms, User};

const USER_COLUMNS: &str = "id, username, password, public_keys, home_dir, status, \
expiration_date, permissions, filters, filesystem, quota_size, quota_files, \
used_quota_size, used_quota_files, last_quota_update, last_login";

/// SQL backend shared by sqlite, postgresql and mysql through the sqlx Any
/// driver. The table name is configurable, so statements are built at
/// runtime with driver-appropriate placeholders; structured user fields are
/// stored as JSON text columns.
pub struct SqlStore {
    pool: AnyPool,
    driver: Driver,
    users_table: String,
}

impl SqlStore {
    pub async fn connect(
        driver: Driver,
        url: &str,
        pool_size: u32,
        users_table: &str,
    ) -> Result<Self, ProviderError> {
        if users_table.is_empty()
            || !users_table
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ProviderError::validation(format!(
                "invalid users_table name: {users_table:?}"
            )));
        }
        let mut options = AnyPoolOptions::new();
        if pool_size > 0 {
            options = options.max_connections(pool_size);
        }
        let pool = options.connect(url).await?;
        let store = Self {
            pool,
            driver,
            users_table: users_table.to_string(),
        };
        store.initialize_schema().await?;
        debug!(
            driver = driver.as_str(),
            users_table, "sql store initialized"
        );
        Ok(store)
    }

    fn placeholder(&self, n: usize) -> String {
        match self.driver {
            Driver::Postgresql => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    fn placeholders(&self, range: std::ops::RangeInclusive<usize>) -> String {
        range
            .map(|n| self.placeholder(n))
            .collect::<Vec<_>>()
            .join(", ")
    }

    async fn initialize_schema(&self) -> Result<(), ProviderError> {
        let table = &self.users_table;
        let ddl = match self.driver {
            Driver::Postgresql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 username VARCHAR(255) NOT NULL UNIQUE, \
                 password TEXT NOT NULL, \
                 public_keys TEXT NOT NULL, \
                 home_dir VARCHAR(512) NOT NULL, \
                 status INTEGER NOT NULL, \
                 expiration_date BIGINT NOT NULL, \
                 permissions TEXT NOT NULL, \
                 filters TEXT NOT NULL, \
                 filesystem TEXT NOT NULL, \
                 quota_size BIGINT NOT NULL, \
                 quota_files INTEGER NOT NULL, \
                 used_quota_size BIGINT NOT NULL, \
                 used_quota_files INTEGER NOT NULL, \
                 last_quota_update BIGINT NOT NULL, \
                 last_login BIGINT NOT NULL)"
            ),
            Driver::Mysql => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGINT NOT NULL AUTO_INCREMENT PRIMARY KEY, \
                 username VARCHAR(255) NOT NULL UNIQUE, \
                 password TEXT NOT NULL, \
                 public_keys TEXT NOT NULL, \
                 home_dir VARCHAR(512) NOT NULL, \
                 status INT NOT NULL, \
                 expiration_date BIGINT NOT NULL, \
                 permissions TEXT NOT NULL, \
                 filters TEXT NOT NULL, \
                 filesystem TEXT NOT NULL, \
                 quota_size BIGINT NOT NULL, \
                 quota_files INT NOT NULL, \
                 used_quota_size BIGINT NOT NULL, \
                 used_quota_files INT NOT NULL, \
                 last_quota_update BIGINT NOT NULL, \
                 last_login BIGINT NOT NULL)"
            ),
            _ => format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 username TEXT NOT NULL UNIQUE, \
                 password TEXT NOT NULL, \
                 public_keys TEXT NOT NULL, \
                 home_dir TEXT NOT NULL, \
                 status INTEGER NOT NULL, \
                 expiration_date BIGINT NOT NULL, \
                 permissions TEXT NOT NULL, \
                 filters TEXT NOT NULL, \
                 filesystem TEXT NOT NULL, \
                 quota_size BIGINT NOT NULL, \
                 quota_files INTEGER NOT NULL, \
                 used_quota_size BIGINT NOT NULL, \
                 used_quota_files INTEGER NOT NULL, \
                 last_quota_update BIGINT NOT NULL, \
                 last_login BIGINT NOT NULL)"
            ),
        };
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_user(row: &AnyRow) -> Result<User, ProviderError> {
        let public_keys: String = row.try_get("public_keys")?;
        let permissions: String = row.try_get("permissions")?;
        let filters: String = row.try_get("filters")?;
        let filesystem: String = row.try_get("filesystem")?;
        Ok(User {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            password: row.try_get("password")?,
            public_keys: json_or_default(&public_keys)?,
            home_dir: row.try_get("home_dir")?,
            status: row.try_get("status")?,
            expiration_date: row.try_get("expiration_date")?,
            permissions: json_or_default(&permissions)?,
            filters: json_or_default(&filters)?,
            fs_config: json_or_default(&filesystem)?,
            quota_size: row.try_get("quota_size")?,
            quota_files: row.try_get("quota_files")?,
            used_quota_size: row.try_get("used_quota_size")?,
            used_quota_files: row.try_get("used_quota_files")?,
            last_quota_update: row.try_get("last_quota_update")?,
            last_login: row.try_get("last_login")?,
        })
    }
}

fn json_or_default<T: DeserializeOwned + Default>(raw: &str) -> Result<T, ProviderError> {
    if raw.is_empty() {
        Ok(T::default())
    } else {
        Ok(serde_json::from_str(raw)?)
    }
}

#[async_trait]
impl UserStore for SqlStore {
    async fn user_by_name(&self, username: &str) -> Result<User, ProviderError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE username = {}",
            self.users_table,
            self.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))?;
        Self::row_to_user(&row)
    }

    async fn user_by_id(&self, id: i64) -> Result<User, ProviderError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} WHERE id = {}",
            self.users_table,
            self.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("user id {id}")))?;
        Self::row_to_user(&row)
    }

    async fn add_user(&self, user: User) -> Result<(), ProviderError> {
        let sql = format!(
            "INSERT INTO {} (username, password, public_keys, home_dir, status, \
             expiration_date, permissions, filters, filesystem, quota_size, quota_files, \
             used_quota_size, used_quota_files, last_quota_update, last_login) \
             VALUES ({})",
            self.users_table,
            self.placeholders(1..=15)
        );
        sqlx::query(&sql)
            .bind(&user.username)
            .bind(&user.password)
            .bind(serde_json::to_string(&user.public_keys)?)
            .bind(&user.home_dir)
            .bind(user.status)
            .bind(user.expiration_date)
            .bind(serde_json::to_string(&user.permissions)?)
            .bind(serde_json::to_string(&user.filters)?)
            .bind(serde_json::to_string(&user.fs_config)?)
            .bind(user.quota_size)
            .bind(user.quota_files)
            .bind(user.used_quota_size)
            .bind(user.used_quota_files)
            .bind(user.last_quota_update)
            .bind(user.last_login)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_user(&self, user: User) -> Result<(), ProviderError> {
        let sql = format!(
            "UPDATE {} SET password = {}, public_keys = {}, home_dir = {}, status = {}, \
             expiration_date = {}, permissions = {}, filters = {}, filesystem = {}, \
             quota_size = {}, quota_files = {} WHERE username = {}",
            self.users_table,
            self.placeholder(1),
            self.placeholder(2),
            self.placeholder(3),
            self.placeholder(4),
            self.placeholder(5),
            self.placeholder(6),
            self.placeholder(7),
            self.placeholder(8),
            self.placeholder(9),
            self.placeholder(10),
            self.placeholder(11)
        );
        let result = sqlx::query(&sql)
            .bind(&user.password)
            .bind(serde_json::to_string(&user.public_keys)?)
            .bind(&user.home_dir)
            .bind(user.status)
            .bind(user.expiration_date)
            .bind(serde_json::to_string(&user.permissions)?)
            .bind(serde_json::to_string(&user.filters)?)
            .bind(serde_json::to_string(&user.fs_config)?)
            .bind(user.quota_size)
            .bind(user.quota_files)
            .bind(&user.username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(format!(
                "username {:?}",
                user.username
            )));
        }
        Ok(())
    }

    async fn delete_user(&self, user: User) -> Result<(), ProviderError> {
        let sql = format!(
            "DELETE FROM {} WHERE username = {}",
            self.users_table,
            self.placeholder(1)
        );
        let result = sqlx::query(&sql)
            .bind(&user.username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(format!(
                "username {:?}",
                user.username
            )));
        }
        Ok(())
    }

    async fn list_users(
        &self,
        limit: i32,
        offset: i32,
        order: ListOrder,
        username: &str,
    ) -> Result<Vec<User>, ProviderError> {
        if !username.is_empty() {
            return match self.user_by_name(username).await {
                Ok(user) => Ok(vec![user]),
                Err(ProviderError::NotFound(_)) => Ok(Vec::new()),
                Err(err) => Err(err),
            };
        }
        let mut sql = format!(
            "SELECT {USER_COLUMNS} FROM {} ORDER BY username {}",
            self.users_table,
            order.as_str()
        );
        if limit > 0 {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if offset > 0 {
            // standalone OFFSET requires a LIMIT clause on mysql and sqlite
            if limit <= 0 {
                match self.driver {
                    Driver::Mysql => sql.push_str(" LIMIT 18446744073709551615"),
                    Driver::Postgresql => {}
                    _ => sql.push_str(" LIMIT -1"),
                }
            }
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_user).collect()
    }

    async fn dump_users(&self) -> Result<Vec<User>, ProviderError> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM {} ORDER BY username ASC",
            self.users_table
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_user).collect()
    }

    async fn update_quota(
        &self,
        username: &str,
        files: i32,
        size: i64,
        reset: bool,
    ) -> Result<(), ProviderError> {
        let sql = if reset {
            format!(
                "UPDATE {} SET used_quota_files = {}, used_quota_size = {}, \
                 last_quota_update = {} WHERE username = {}",
                self.users_table,
                self.placeholder(1),
                self.placeholder(2),
                self.placeholder(3),
                self.placeholder(4)
            )
        } else {
            format!(
                "UPDATE {} SET used_quota_files = used_quota_files + {}, \
                 used_quota_size = used_quota_size + {}, last_quota_update = {} \
                 WHERE username = {}",
                self.users_table,
                self.placeholder(1),
                self.placeholder(2),
                self.placeholder(3),
                self.placeholder(4)
            )
        };
        let result = sqlx::query(&sql)
            .bind(files)
            .bind(size)
            .bind(now_ms())
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(format!("username {username:?}")));
        }
        Ok(())
    }

    async fn used_quota(&self, username: &str) -> Result<(i32, i64), ProviderError> {
        let sql = format!(
            "SELECT used_quota_files, used_quota_size FROM {} WHERE username = {}",
            self.users_table,
            self.placeholder(1)
        );
        let row = sqlx::query(&sql)
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))?;
        Ok((
            row.try_get("used_quota_files")?,
            row.try_get("used_quota_size")?,
        ))
    }

    async fn update_last_login(&self, username: &str) -> Result<(), ProviderError> {
        let sql = format!(
            "UPDATE {} SET last_login = {} WHERE username = {}",
            self.users_table,
            self.placeholder(1),
            self.placeholder(2)
        );
        let result = sqlx::query(&sql)
            .bind(now_ms())
            .bind(username)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(ProviderError::not_found(format!("username {username:?}")));
        }
        Ok(())
    }

    async fn check_availability(&self) -> Result<(), ProviderError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.pool.close().await;
        Ok(())
    }

    async fn reload_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
