use std::path::Path;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::app::AppState;
use crate::config::Operation;
use crate::store::UserStore;
use crate::users::User;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Fan an administrative mutation out to the configured side effects on a
/// detached task. The originating call never waits for, or sees failures
/// from, the notifications.
pub(crate) fn dispatch(state: &AppState, operation: Operation, user: &User) {
    let state = state.clone();
    let user = user.clone();
    tokio::spawn(async move {
        execute_action(state, operation, user).await;
    });
}

pub(crate) async fn execute_action(state: AppState, operation: Operation, mut user: User) {
    if !state.config.actions.execute_on.contains(&operation) {
        return;
    }
    // Re-read the user so notifications carry the stored state (assigned id,
    // hashed password, normalized permissions). Deleted users are gone, the
    // caller-supplied record is all there is.
    if operation != Operation::Delete {
        user = match state.store.user_by_name(&user.username).await {
            Ok(user) => user,
            Err(err) => {
                warn!(
                    operation = %operation,
                    username = %user.username,
                    error = %err,
                    "unable to fetch the user to notify"
                );
                return;
            }
        };
    }

    let command = state.config.actions.command.clone();
    let url = state.config.actions.http_notification_url.clone();
    if !command.is_empty() && Path::new(&command).is_absolute() {
        if url.is_empty() {
            run_notification_command(&state, operation, &user).await;
        } else {
            // the HTTP notification must not wait for the command
            let command_state = state.clone();
            let command_user = user.clone();
            tokio::spawn(async move {
                run_notification_command(&command_state, operation, &command_user).await;
            });
        }
    }
    if !url.is_empty() {
        post_notification(&state, operation, user).await;
    }
}

async fn run_notification_command(state: &AppState, operation: Operation, user: &User) {
    let started = Instant::now();
    let mut command = Command::new(&state.config.actions.command);
    command.args(user.notification_args(operation));
    command.envs(user.notification_env(operation));
    command.kill_on_drop(true);
    let outcome = timeout(COMMAND_TIMEOUT, command.status()).await;
    let success = matches!(&outcome, Ok(Ok(status)) if status.success());
    match outcome {
        Ok(Ok(status)) => debug!(
            command = %state.config.actions.command,
            operation = %operation,
            username = %user.username,
            %status,
            elapsed = ?started.elapsed(),
            "executed notification command"
        ),
        Ok(Err(err)) => warn!(
            command = %state.config.actions.command,
            operation = %operation,
            error = %err,
            "failed to execute notification command"
        ),
        Err(_) => warn!(
            command = %state.config.actions.command,
            operation = %operation,
            "notification command timed out"
        ),
    }
    state.metrics.record_notification("command", success);
}

async fn post_notification(state: &AppState, operation: Operation, mut user: User) {
    user.hide_sensitive_data();
    let url = &state.config.actions.http_notification_url;
    let started = Instant::now();
    let response = state
        .http_client
        .post(url)
        .query(&[("action", operation.as_str())])
        .json(&user)
        .timeout(HTTP_TIMEOUT)
        .send()
        .await;
    let success = matches!(&response, Ok(resp) if resp.status().is_success());
    match response {
        Ok(resp) => debug!(
            %url,
            operation = %operation,
            username = %user.username,
            status = resp.status().as_u16(),
            elapsed = ?started.elapsed(),
            "notified operation"
        ),
        Err(err) => warn!(
            %url,
            operation = %operation,
            error = %err,
            "notification POST failed"
        ),
    }
    state.metrics.record_notification("http", success);
}
