use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use crate::error::ProviderError;
use crate::store::{sort_and_page, ListOrder, UserStore};
use crate::users::{now_ms, validate_user, User, ValidationSettings};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    usernames_by_id: HashMap<i64, String>,
    last_id: i64,
}

/// Map-backed store, mainly for tests and throwaway setups. Optionally
/// seeded from a JSON dump file, which `reload_config` re-reads.
pub struct MemoryStore {
    users_file: Option<PathBuf>,
    settings: ValidationSettings,
    inner: Mutex<Inner>,
}

#[derive(Deserialize)]
struct UsersDump {
    #[serde(default)]
    users: Vec<User>,
}

impl MemoryStore {
    pub fn new(users_file: Option<PathBuf>, settings: ValidationSettings) -> Self {
        Self {
            users_file,
            settings,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store mutex poisoned")
    }

    fn load_users_file(&self, path: &PathBuf) -> Result<Inner, ProviderError> {
        let raw = std::fs::read(path)?;
        let dump: UsersDump = serde_json::from_slice(&raw)?;
        let mut inner = Inner::default();
        for mut user in dump.users {
            validate_user(&mut user, &self.settings)?;
            if user.id <= 0 {
                inner.last_id += 1;
                user.id = inner.last_id;
            } else {
                inner.last_id = inner.last_id.max(user.id);
            }
            inner.usernames_by_id.insert(user.id, user.username.clone());
            inner.users.insert(user.username.clone(), user);
        }
        Ok(inner)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_name(&self, username: &str) -> Result<User, ProviderError> {
        self.lock()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))
    }

    async fn user_by_id(&self, id: i64) -> Result<User, ProviderError> {
        let inner = self.lock();
        inner
            .usernames_by_id
            .get(&id)
            .and_then(|username| inner.users.get(username))
            .cloned()
            .ok_or_else(|| ProviderError::not_found(format!("user id {id}")))
    }

    async fn add_user(&self, mut user: User) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        if inner.users.contains_key(&user.username) {
            return Err(ProviderError::validation(format!(
                "username {:?} already exists",
                user.username
            )));
        }
        inner.last_id += 1;
        user.id = inner.last_id;
        inner.usernames_by_id.insert(user.id, user.username.clone());
        inner.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn update_user(&self, mut user: User) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        let existing_id = inner
            .users
            .get(&user.username)
            .map(|existing| existing.id)
            .ok_or_else(|| ProviderError::not_found(format!("username {:?}", user.username)))?;
        user.id = existing_id;
        inner.users.insert(user.username.clone(), user);
        Ok(())
    }

    async fn delete_user(&self, user: User) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        let removed = inner
            .users
            .remove(&user.username)
            .ok_or_else(|| ProviderError::not_found(format!("username {:?}", user.username)))?;
        inner.usernames_by_id.remove(&removed.id);
        Ok(())
    }

    async fn list_users(
        &self,
        limit: i32,
        offset: i32,
        order: ListOrder,
        username: &str,
    ) -> Result<Vec<User>, ProviderError> {
        let inner = self.lock();
        if !username.is_empty() {
            return Ok(inner.users.get(username).cloned().into_iter().collect());
        }
        let users: Vec<User> = inner.users.values().cloned().collect();
        Ok(sort_and_page(users, limit, offset, order))
    }

    async fn dump_users(&self) -> Result<Vec<User>, ProviderError> {
        let mut users: Vec<User> = self.lock().users.values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(users)
    }

    async fn update_quota(
        &self,
        username: &str,
        files: i32,
        size: i64,
        reset: bool,
    ) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))?;
        if reset {
            user.used_quota_files = files;
            user.used_quota_size = size;
        } else {
            user.used_quota_files += files;
            user.used_quota_size += size;
        }
        user.last_quota_update = now_ms();
        Ok(())
    }

    async fn used_quota(&self, username: &str) -> Result<(i32, i64), ProviderError> {
        let inner = self.lock();
        let user = inner
            .users
            .get(username)
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))?;
        Ok((user.used_quota_files, user.used_quota_size))
    }

    async fn update_last_login(&self, username: &str) -> Result<(), ProviderError> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(username)
            .ok_or_else(|| ProviderError::not_found(format!("username {username:?}")))?;
        user.last_login = now_ms();
        Ok(())
    }

    async fn check_availability(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn reload_config(&self) -> Result<(), ProviderError> {
        let Some(path) = &self.users_file else {
            return Ok(());
        };
        let loaded = self.load_users_file(path)?;
        info!(
            users = loaded.users.len(),
            file = %path.display(),
            "reloaded users from dump file"
        );
        *self.lock() = loaded;
        Ok(())
    }
}
