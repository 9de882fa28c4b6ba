mod support;

use anyhow::Result;
use user_service::config::Driver;
use user_service::error::ProviderError;
use user_service::quota;
use user_service::store::ListOrder;
use user_service::user_ops;
use user_service::users::PERM_ANY;

use support::{base_config, build_state, test_user};

#[tokio::test]
async fn sqlite_store_supports_the_full_user_lifecycle() -> Result<()> {
    let provider = build_state(base_config(Driver::Sqlite)).await?;
    let state = &provider.state;

    for name in ["ada", "brian", "chloe"] {
        let user = test_user(name, &provider.dir.path().join(name));
        user_ops::add_user(state, user).await?;
    }

    let ada = user_ops::user_exists(state, "ada").await?;
    assert!(ada.id > 0);
    assert!(ada.password.starts_with("$argon2id$"));
    assert_eq!(ada.permissions.get("/"), Some(&vec![PERM_ANY.to_string()]));
    assert_eq!(user_ops::get_user_by_id(state, ada.id).await?.username, "ada");

    // unique usernames are enforced by the schema
    let duplicate = test_user("ada", &provider.dir.path().join("ada"));
    assert!(matches!(
        user_ops::add_user(state, duplicate).await,
        Err(ProviderError::Database(_))
    ));

    let descending = user_ops::get_users(state, 2, 0, ListOrder::Descending, "").await?;
    let names: Vec<_> = descending.iter().map(|u| u.username.as_str()).collect();
    assert_eq!(names, ["chloe", "brian"]);
    let offset = user_ops::get_users(state, 0, 2, ListOrder::Ascending, "").await?;
    assert_eq!(offset.len(), 1);
    assert_eq!(offset[0].username, "chloe");

    quota::update_user_quota(state, &ada, 7, 2048, true).await?;
    assert_eq!(quota::get_used_quota(state, "ada").await?, (7, 2048));
    quota::update_user_quota(state, &ada, 1, 32, false).await?;
    assert_eq!(quota::get_used_quota(state, "ada").await?, (8, 2080));
    let refreshed = user_ops::user_exists(state, "ada").await?;
    assert!(refreshed.last_quota_update > 0);

    user_ops::update_last_login(state, "ada").await?;
    assert!(user_ops::user_exists(state, "ada").await?.last_login > 0);

    let mut updated = refreshed.clone();
    updated.quota_files = 10;
    user_ops::update_user(state, updated).await?;
    let after_update = user_ops::user_exists(state, "ada").await?;
    assert_eq!(after_update.id, refreshed.id);
    assert_eq!(after_update.quota_files, 10);

    let dumped = user_ops::dump_users(state).await?;
    assert_eq!(dumped.len(), 3);
    assert!(dumped.iter().all(|u| u.password.starts_with("$argon2id$")));

    user_ops::delete_user(state, after_update).await?;
    assert!(matches!(
        user_ops::user_exists(state, "ada").await,
        Err(ProviderError::NotFound(_))
    ));
    assert!(matches!(
        quota::update_user_quota(
            state,
            &user_ops::user_exists(state, "brian").await?,
            0,
            0,
            true
        )
        .await,
        Ok(())
    ));
    assert!(matches!(
        user_ops::update_last_login(state, "ada").await,
        Err(ProviderError::NotFound(_))
    ));

    provider.state.close().await?;
    Ok(())
}

#[tokio::test]
async fn sqlite_database_file_lands_in_the_config_dir() -> Result<()> {
    let provider = build_state(base_config(Driver::Sqlite)).await?;
    assert!(provider.dir.path().join("users.db").exists());
    provider.state.close().await?;
    Ok(())
}
