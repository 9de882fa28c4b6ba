use std::str::FromStr;

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::users::User;

mod kv;
mod memory;
mod sql;

pub use kv::SledStore;
pub use memory::MemoryStore;
pub use sql::SqlStore;

/// Sort direction for [`UserStore::list_users`], on username.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListOrder {
    #[default]
    Ascending,
    Descending,
}

impl ListOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListOrder::Ascending => "ASC",
            ListOrder::Descending => "DESC",
        }
    }
}

impl FromStr for ListOrder {
    type Err = ProviderError;

    fn from_str(value: &str) -> Result<Self, ProviderError> {
        match value {
            "ASC" => Ok(ListOrder::Ascending),
            "DESC" => Ok(ListOrder::Descending),
            other => Err(ProviderError::validation(format!(
                "invalid list order: {other}"
            ))),
        }
    }
}

/// Capability interface every user store backend implements. Records handed
/// to the mutating operations are expected to be validated already; the
/// credential checks are provided methods so each backend inherits identical
/// authentication semantics.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn user_by_name(&self, username: &str) -> Result<User, ProviderError>;

    async fn user_by_id(&self, id: i64) -> Result<User, ProviderError>;

    async fn add_user(&self, user: User) -> Result<(), ProviderError>;

    async fn update_user(&self, user: User) -> Result<(), ProviderError>;

    async fn delete_user(&self, user: User) -> Result<(), ProviderError>;

    /// When `username` is non-empty it is an exact-match filter and
    /// `limit`/`offset` do not apply. `limit <= 0` means unlimited.
    async fn list_users(
        &self,
        limit: i32,
        offset: i32,
        order: ListOrder,
        username: &str,
    ) -> Result<Vec<User>, ProviderError>;

    /// Full records, password hashes included, for backup export.
    async fn dump_users(&self) -> Result<Vec<User>, ProviderError>;

    /// With `reset` the deltas are absolute totals. Also refreshes the
    /// last-quota-update timestamp.
    async fn update_quota(
        &self,
        username: &str,
        files: i32,
        size: i64,
        reset: bool,
    ) -> Result<(), ProviderError>;

    async fn used_quota(&self, username: &str) -> Result<(i32, i64), ProviderError>;

    async fn update_last_login(&self, username: &str) -> Result<(), ProviderError>;

    async fn check_availability(&self) -> Result<(), ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;

    /// Only meaningful for the memory backend, which re-reads its dump
    /// file; every other backend succeeds without action.
    async fn reload_config(&self) -> Result<(), ProviderError>;

    async fn authenticate_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<User, ProviderError> {
        let user = self.user_by_name(username).await?;
        crate::auth::verify_user_password(user, password)
    }

    async fn authenticate_public_key(
        &self,
        username: &str,
        public_key: &[u8],
    ) -> Result<(User, String), ProviderError> {
        let user = self.user_by_name(username).await?;
        crate::auth::verify_user_public_key(user, public_key)
    }
}

pub(crate) fn sort_and_page(
    mut users: Vec<User>,
    limit: i32,
    offset: i32,
    order: ListOrder,
) -> Vec<User> {
    users.sort_by(|a, b| match order {
        ListOrder::Ascending => a.username.cmp(&b.username),
        ListOrder::Descending => b.username.cmp(&a.username),
    });
    let offset = offset.max(0) as usize;
    if offset >= users.len() {
        return Vec::new();
    }
    let mut users = users.split_off(offset);
    if limit > 0 {
        users.truncate(limit as usize);
    }
    users
}
