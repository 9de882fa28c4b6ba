//! Management-plane operations over the user store. Mutations are gated on
//! `manage_users` and fire the action dispatcher; internal updates (quota
//! counters, last login) never do.

use crate::actions;
use crate::app::AppState;
use crate::config::Operation;
use crate::error::{ProviderError, MANAGE_USERS_DISABLED};
use crate::store::{ListOrder, UserStore};
use crate::users::{load_gcs_credentials, validate_user, User, FS_PROVIDER_GCS};

pub async fn add_user(state: &AppState, mut user: User) -> Result<(), ProviderError> {
    if state.config.manage_users == 0 {
        return Err(ProviderError::MethodDisabled(MANAGE_USERS_DISABLED));
    }
    validate_user(&mut user, &state.validation)?;
    state.store.add_user(user.clone()).await?;
    actions::dispatch(state, Operation::Add, &user);
    Ok(())
}

pub async fn update_user(state: &AppState, mut user: User) -> Result<(), ProviderError> {
    if state.config.manage_users == 0 {
        return Err(ProviderError::MethodDisabled(MANAGE_USERS_DISABLED));
    }
    validate_user(&mut user, &state.validation)?;
    state.store.update_user(user.clone()).await?;
    actions::dispatch(state, Operation::Update, &user);
    Ok(())
}

pub async fn delete_user(state: &AppState, user: User) -> Result<(), ProviderError> {
    if state.config.manage_users == 0 {
        return Err(ProviderError::MethodDisabled(MANAGE_USERS_DISABLED));
    }
    state.store.delete_user(user.clone()).await?;
    actions::dispatch(state, Operation::Delete, &user);
    Ok(())
}

/// Fetch a user by name; an error if no match is found.
pub async fn user_exists(state: &AppState, username: &str) -> Result<User, ProviderError> {
    state.store.user_by_name(username).await
}

pub async fn get_user_by_id(state: &AppState, id: i64) -> Result<User, ProviderError> {
    state.store.user_by_id(id).await
}

pub async fn get_users(
    state: &AppState,
    limit: i32,
    offset: i32,
    order: ListOrder,
    username: &str,
) -> Result<Vec<User>, ProviderError> {
    state.store.list_users(limit, offset, order, username).await
}

/// Full records for backup export, password hashes included and GCS
/// credential files re-embedded as base64 blobs.
pub async fn dump_users(state: &AppState) -> Result<Vec<User>, ProviderError> {
    let mut users = state.store.dump_users().await?;
    for user in &mut users {
        if user.fs_config.provider == FS_PROVIDER_GCS {
            load_gcs_credentials(user, &state.validation)?;
        }
    }
    Ok(users)
}

pub async fn update_last_login(state: &AppState, username: &str) -> Result<(), ProviderError> {
    if state.config.manage_users == 0 {
        return Err(ProviderError::MethodDisabled(MANAGE_USERS_DISABLED));
    }
    state.store.update_last_login(username).await
}

/// Re-read backend configuration where supported; only the memory backend
/// does anything with this.
pub async fn reload_config(state: &AppState) -> Result<(), ProviderError> {
    state.store.reload_config().await
}
