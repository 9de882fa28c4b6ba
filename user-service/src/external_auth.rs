use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, info};

use crate::app::AppState;
use crate::auth::KeyboardChallenge;
use crate::error::ProviderError;
use crate::store::UserStore;
use crate::users::{validate_user, User};

const AUTH_PROGRAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Run the configured external auth program and upsert the user it returns.
///
/// The program sees the login attempt through `SFTPGO_AUTHD_*` environment
/// variables and answers with a single JSON user record on stdout; an empty
/// username means the credentials were rejected. On success the record is
/// written back to the store, keeping the existing id, quota counters and
/// last-login, without going through the manage_users gate and without
/// firing actions. The freshly fetched record is returned.
pub(crate) async fn authenticate(
    state: &AppState,
    username: &str,
    password: &str,
    public_key: Option<&[u8]>,
    keyboard_interactive: bool,
) -> Result<User, ProviderError> {
    let public_key_line = match public_key {
        Some(blob) => {
            let key = ssh_key::PublicKey::from_bytes(blob).map_err(|err| {
                ProviderError::ExternalAuth(format!("invalid public key: {err}"))
            })?;
            key.to_openssh().map_err(|err| {
                ProviderError::ExternalAuth(format!("could not encode public key: {err}"))
            })?
        }
        None => String::new(),
    };

    let output = timeout(
        AUTH_PROGRAM_TIMEOUT,
        Command::new(&state.config.external_auth_program)
            .env("SFTPGO_AUTHD_USERNAME", username)
            .env("SFTPGO_AUTHD_PASSWORD", password)
            .env("SFTPGO_AUTHD_PUBLIC_KEY", &public_key_line)
            .env(
                "SFTPGO_AUTHD_KEYBOARD_INTERACTIVE",
                if keyboard_interactive { "1" } else { "" },
            )
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ProviderError::ExternalAuth("auth program timed out".to_string()))?
    .map_err(|err| ProviderError::ExternalAuth(format!("failed to run auth program: {err}")))?;

    if !output.status.success() {
        return Err(ProviderError::ExternalAuth(format!(
            "auth program exited with {}",
            output.status
        )));
    }
    let mut user: User = serde_json::from_slice(&output.stdout).map_err(|err| {
        ProviderError::ExternalAuth(format!("invalid auth program response: {err}"))
    })?;
    if user.username.is_empty() {
        debug!(username, "external auth program rejected the login");
        return Err(ProviderError::InvalidCredentials);
    }
    // The submitted secrets are written back so the password is re-hashed on
    // persistence and a new public key is remembered.
    if !password.is_empty() {
        user.password = password.to_string();
    }
    if !public_key_line.is_empty()
        && !user
            .public_keys
            .iter()
            .any(|key| key.trim_end() == public_key_line.trim_end())
    {
        user.public_keys.push(public_key_line.trim_end().to_string());
    }

    match state.store.user_by_name(&user.username).await {
        Ok(existing) => {
            user.id = existing.id;
            user.used_quota_files = existing.used_quota_files;
            user.used_quota_size = existing.used_quota_size;
            user.last_quota_update = existing.last_quota_update;
            user.last_login = existing.last_login;
            validate_user(&mut user, &state.validation)?;
            state.store.update_user(user).await?;
        }
        Err(ProviderError::NotFound(_)) => {
            validate_user(&mut user, &state.validation)?;
            state.store.add_user(user).await?;
        }
        Err(err) => return Err(err),
    }
    state.store.user_by_name(username).await
}

#[derive(Debug, Deserialize)]
struct KeyboardAuthResponse {
    #[serde(default)]
    instruction: String,
    #[serde(default)]
    questions: Vec<String>,
    #[serde(default)]
    echos: Vec<bool>,
    #[serde(default)]
    auth_result: i32,
}

/// Drive a keyboard-interactive exchange with `auth_program`: the program
/// emits newline-delimited JSON challenges on stdout, the client's answers
/// are written back one per line. Success iff the final `auth_result` is 1.
pub(crate) async fn keyboard_interactive_auth(
    user: User,
    auth_program: &str,
    challenge: KeyboardChallenge<'_>,
) -> Result<User, ProviderError> {
    // kill_on_drop on the child makes the deadline path terminate the
    // program too: dropping the cancelled future reaps it.
    let auth_result = timeout(
        AUTH_PROGRAM_TIMEOUT,
        run_keyboard_program(&user, auth_program, challenge),
    )
    .await
    .map_err(|_| {
        ProviderError::ExternalAuth("keyboard interactive program timed out".to_string())
    })??;
    if auth_result != 1 {
        debug!(
            username = %user.username,
            auth_result,
            "keyboard interactive auth failed"
        );
        return Err(ProviderError::InvalidCredentials);
    }
    Ok(user)
}

// Terminates the child at most once, whatever combination of parse failure,
// short answers and write errors hits the exchange.
struct AuthProgramGuard {
    child: Child,
    finished: bool,
}

impl AuthProgramGuard {
    async fn terminate(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        info!("terminating keyboard interactive auth program after an unexpected error");
        if let Err(err) = self.child.kill().await {
            debug!(error = %err, "failed to kill keyboard interactive auth program");
        }
    }
}

async fn run_keyboard_program(
    user: &User,
    auth_program: &str,
    challenge: KeyboardChallenge<'_>,
) -> Result<i32, ProviderError> {
    let mut child = Command::new(auth_program)
        .env("SFTPGO_AUTHD_USERNAME", &user.username)
        .env("SFTPGO_AUTHD_PASSWORD", &user.password)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| {
            ProviderError::ExternalAuth(format!(
                "failed to start keyboard interactive program: {err}"
            ))
        })?;
    let stdout = child.stdout.take().ok_or_else(|| {
        ProviderError::ExternalAuth("cannot capture keyboard interactive stdout".to_string())
    })?;
    let mut stdin = child.stdin.take().ok_or_else(|| {
        ProviderError::ExternalAuth("cannot capture keyboard interactive stdin".to_string())
    })?;
    let mut guard = AuthProgramGuard {
        child,
        finished: false,
    };

    let mut lines = BufReader::new(stdout).lines();
    let mut auth_result = 0;
    while let Some(line) = lines.next_line().await? {
        let response: KeyboardAuthResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                info!(error = %err, "keyboard interactive program sent an unparsable response");
                guard.terminate().await;
                return Err(ProviderError::ExternalAuth(
                    "invalid keyboard interactive response".to_string(),
                ));
            }
        };
        if response.auth_result != 0 {
            auth_result = response.auth_result;
            break;
        }
        if response.questions.is_empty() {
            info!("keyboard interactive response does not contain questions");
            guard.terminate().await;
            return Err(ProviderError::ExternalAuth(
                "keyboard interactive response without questions".to_string(),
            ));
        }
        if response.questions.len() != response.echos.len() {
            info!(
                questions = response.questions.len(),
                echos = response.echos.len(),
                "keyboard interactive questions do not match echos"
            );
            guard.terminate().await;
            return Err(ProviderError::ExternalAuth(
                "keyboard interactive questions do not match echos".to_string(),
            ));
        }
        let answers = match challenge(
            &user.username,
            &response.instruction,
            &response.questions,
            &response.echos,
        ) {
            Ok(answers) => answers,
            Err(err) => {
                info!(error = %err, "keyboard interactive client challenge failed");
                guard.terminate().await;
                return Err(err);
            }
        };
        if answers.len() != response.questions.len() {
            info!(
                expected = response.questions.len(),
                actual = answers.len(),
                "keyboard interactive client sent a short answer list"
            );
            guard.terminate().await;
            return Err(ProviderError::ExternalAuth(
                "keyboard interactive answers do not match questions".to_string(),
            ));
        }
        for answer in &answers {
            let mut line = answer.clone();
            if cfg!(windows) {
                line.push('\r');
            }
            line.push('\n');
            if let Err(err) = stdin.write_all(line.as_bytes()).await {
                error!(error = %err, "unable to write client answer to keyboard interactive program");
                guard.terminate().await;
                return Err(ProviderError::Io(err));
            }
        }
    }
    drop(stdin);
    // Normal completion: let the program exit on its own and reap it in the
    // background.
    guard.finished = true;
    tokio::spawn(async move {
        let _ = guard.child.wait().await;
    });
    Ok(auth_result)
}
