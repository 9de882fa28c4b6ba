mod support;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use user_service::error::ProviderError;
use user_service::user_ops::{self, dump_users};
use user_service::users::{AccessSecret, S3FsConfig, FS_PROVIDER_GCS, FS_PROVIDER_S3};

use support::{memory_provider, test_user};

const SERVICE_ACCOUNT_JSON: &str = r#"{"type":"service_account","project_id":"demo"}"#;

#[tokio::test]
async fn s3_secret_is_persisted_encrypted_and_exposed_redacted() -> Result<()> {
    let provider = memory_provider().await?;
    let state = &provider.state;
    let mut ana = test_user("ana", &provider.dir.path().join("ana"));
    ana.fs_config.provider = FS_PROVIDER_S3;
    ana.fs_config.s3_config = S3FsConfig {
        bucket: "backups".to_string(),
        region: "eu-west-1".to_string(),
        access_key: "AKIAEXAMPLE".to_string(),
        access_secret: AccessSecret::Plaintext("wJalrXUtnFEMI".to_string()),
        endpoint: String::new(),
    };
    user_ops::add_user(state, ana).await?;

    let mut stored = user_ops::user_exists(state, "ana").await?;
    let envelope = match &stored.fs_config.s3_config.access_secret {
        AccessSecret::Encrypted(value) => value.clone(),
        other => panic!("expected an encrypted secret, got {other:?}"),
    };
    assert_eq!(common_crypto::decrypt(&envelope)?, "wJalrXUtnFEMI");

    // updating with the stored envelope keeps it stable
    user_ops::update_user(state, stored.clone()).await?;
    let unchanged = user_ops::user_exists(state, "ana").await?;
    assert_eq!(
        unchanged.fs_config.s3_config.access_secret.as_str(),
        envelope
    );

    stored.hide_sensitive_data();
    match &stored.fs_config.s3_config.access_secret {
        AccessSecret::Redacted(value) => {
            assert!(value.starts_with("$aes$$"));
            assert!(matches!(
                common_crypto::decrypt(value),
                Err(common_crypto::CryptoError::MissingKey)
            ));
        }
        other => panic!("expected a redacted secret, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn gcs_credentials_move_to_disk_and_back_on_export() -> Result<()> {
    let provider = memory_provider().await?;
    let state = &provider.state;
    let mut bea = test_user("bea", &provider.dir.path().join("bea"));
    bea.fs_config.provider = FS_PROVIDER_GCS;
    bea.fs_config.gcs_config.bucket = "gcs-backups".to_string();
    bea.fs_config.gcs_config.credentials = BASE64_STANDARD.encode(SERVICE_ACCOUNT_JSON);
    user_ops::add_user(state, bea).await?;

    // the blob left the record and landed on disk, mode 0600
    let stored = user_ops::user_exists(state, "bea").await?;
    assert!(stored.fs_config.gcs_config.credentials.is_empty());
    let credentials_file = provider
        .dir
        .path()
        .join("credentials")
        .join("bea_gcs_credentials.json");
    assert_eq!(
        std::fs::read_to_string(&credentials_file)?,
        SERVICE_ACCOUNT_JSON
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&credentials_file)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    // updates without a blob validate against the existing file
    user_ops::update_user(state, stored).await?;

    // backup export re-embeds the file content
    let dumped = dump_users(state).await?;
    assert_eq!(dumped.len(), 1);
    assert_eq!(
        dumped[0].fs_config.gcs_config.credentials,
        BASE64_STANDARD.encode(SERVICE_ACCOUNT_JSON)
    );
    Ok(())
}

#[tokio::test]
async fn gcs_users_without_credentials_are_rejected() -> Result<()> {
    let provider = memory_provider().await?;
    let mut cal = test_user("cal", &provider.dir.path().join("cal"));
    cal.fs_config.provider = FS_PROVIDER_GCS;
    cal.fs_config.gcs_config.bucket = "bucket".to_string();
    assert!(matches!(
        user_ops::add_user(&provider.state, cal).await,
        Err(ProviderError::Validation(_))
    ));
    Ok(())
}

#[tokio::test]
async fn s3_users_without_a_bucket_are_rejected() -> Result<()> {
    let provider = memory_provider().await?;
    let mut dan = test_user("dan", &provider.dir.path().join("dan"));
    dan.fs_config.provider = FS_PROVIDER_S3;
    dan.fs_config.s3_config.region = "us-east-1".to_string();
    dan.fs_config.s3_config.access_key = "AKIA".to_string();
    dan.fs_config.s3_config.access_secret = AccessSecret::Plaintext("pw".to_string());
    assert!(matches!(
        user_ops::add_user(&provider.state, dan).await,
        Err(ProviderError::Validation(_))
    ));
    Ok(())
}
