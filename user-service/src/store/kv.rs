use std::path::Path;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::ProviderError;
use crate::store::{sort_and_page, ListOrder, UserStore};
use crate::users::{now_ms, User};

const USERS_TREE: &str = "users";
const IDS_TREE: &str = "user_ids";

/// Embedded key/value backend: a single on-disk sled database with a
/// username -> JSON record tree and an id -> username index tree. Read
/// paths go straight to sled; every read-modify-write cycle is serialized
/// through a single-writer mutex so the two trees stay consistent.
pub struct SledStore {
    db: sled::Db,
    users: sled::Tree,
    ids: sled::Tree,
    write_lock: Mutex<()>,
}

impl SledStore {
    pub fn open(path: &Path) -> Result<Self, ProviderError> {
        let db = sled::open(path)?;
        let users = db.open_tree(USERS_TREE)?;
        let ids = db.open_tree(IDS_TREE)?;
        Ok(Self {
            db,
            users,
            ids,
            write_lock: Mutex::new(()),
        })
    }

    fn fetch(&self, username: &str) -> Result<User, ProviderError> {
        match self.users.get(username.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(ProviderError::not_found(format!("username {username:?}"))),
        }
    }

    fn put(&self, user: &User) -> Result<(), ProviderError> {
        self.users
            .insert(user.username.as_bytes(), serde_json::to_vec(user)?)?;
        self.ids
            .insert(user.id.to_be_bytes(), user.username.as_bytes())?;
        Ok(())
    }

    fn all_users(&self) -> Result<Vec<User>, ProviderError> {
        let mut users = Vec::new();
        for entry in self.users.iter() {
            let (_, raw) = entry?;
            users.push(serde_json::from_slice(&raw)?);
        }
        Ok(users)
    }
}

#[async_trait]
impl UserStore for SledStore {
    async fn user_by_name(&self, username: &str) -> Result<User, ProviderError> {
        self.fetch(username)
    }

    async fn user_by_id(&self, id: i64) -> Result<User, ProviderError> {
        match self.ids.get(id.to_be_bytes())? {
            Some(raw) => {
                let username = String::from_utf8_lossy(&raw).into_owned();
                self.fetch(&username)
            }
            None => Err(ProviderError::not_found(format!("user id {id}"))),
        }
    }

    async fn add_user(&self, mut user: User) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        if self.users.contains_key(user.username.as_bytes())? {
            return Err(ProviderError::validation(format!(
                "username {:?} already exists",
                user.username
            )));
        }
        user.id = self.db.generate_id()? as i64 + 1;
        self.put(&user)
    }

    async fn update_user(&self, mut user: User) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.fetch(&user.username)?;
        user.id = existing.id;
        self.put(&user)
    }

    async fn delete_user(&self, user: User) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let existing = self.fetch(&user.username)?;
        self.users.remove(existing.username.as_bytes())?;
        self.ids.remove(existing.id.to_be_bytes())?;
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
            return match self.fetch(username) {
                Ok(user) => Ok(vec![user]),
                Err(ProviderError::NotFound(_)) => Ok(Vec::new()),
                Err(err) => Err(err),
            };
        }
        Ok(sort_and_page(self.all_users()?, limit, offset, order))
    }

    async fn dump_users(&self) -> Result<Vec<User>, ProviderError> {
        let mut users = self.all_users()?;
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
        let _guard = self.write_lock.lock().await;
        let mut user = self.fetch(username)?;
        if reset {
            user.used_quota_files = files;
            user.used_quota_size = size;
        } else {
            user.used_quota_files += files;
            user.used_quota_size += size;
        }
        user.last_quota_update = now_ms();
        self.put(&user)
    }

    async fn used_quota(&self, username: &str) -> Result<(i32, i64), ProviderError> {
        let user = self.fetch(username)?;
        Ok((user.used_quota_files, user.used_quota_size))
    }

    async fn update_last_login(&self, username: &str) -> Result<(), ProviderError> {
        let _guard = self.write_lock.lock().await;
        let mut user = self.fetch(username)?;
        user.last_login = now_ms();
        self.put(&user)
    }

    async fn check_availability(&self) -> Result<(), ProviderError> {
        self.db.size_on_disk()?;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        self.db.flush()?;
        Ok(())
    }

    async fn reload_config(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}
