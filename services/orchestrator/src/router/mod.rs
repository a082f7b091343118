//! Command router.
//!
//! Every command goes through [`dispatch`]: authorize against the lifecycle
//! and the caller, run the handler, convert any failure (including a panic)
//! into a failed envelope, and notify the hooks.

pub mod authz;
mod handlers;

use std::panic::AssertUnwindSafe;
use std::time::Instant;

use babel_protocol::{CommandEnvelope, CommandResult};
use futures_util::FutureExt;
use tracing::{error, warn};

use crate::auth::{Caller, Session};
use crate::error::{diagnostics, CommandError};
use crate::hooks::CommandCompleted;
use crate::state::AppState;

pub use authz::Target;

/// Authorize and run one command as `caller`.
pub async fn dispatch(state: &AppState, caller: &Caller, envelope: CommandEnvelope) -> CommandResult {
    let started = Instant::now();

    let outcome = AssertUnwindSafe(execute(state, caller, &envelope))
        .catch_unwind()
        .await;
    let result = match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            if err.is_rejection() {
                warn!(command = %envelope.command, caller = %caller.describe(), error = %err, "Command rejected");
            } else {
                error!(command = %envelope.command, caller = %caller.describe(), error = %err, "Command failed");
            }
            err.into_result(&envelope)
        }
        Err(_) => {
            error!(command = %envelope.command, "Command handler panicked");
            CommandResult::failure(format!("internal error while running '{}'", envelope.command))
                .with_object(diagnostics(&envelope))
        }
    };

    state
        .hooks()
        .command_completed(CommandCompleted {
            command: envelope.command.clone(),
            lang: envelope.lang.clone(),
            caller: caller.describe(),
            status: result.status,
            message: result.message.clone(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
        .await;

    result
}

async fn execute(
    state: &AppState,
    caller: &Caller,
    envelope: &CommandEnvelope,
) -> Result<CommandResult, CommandError> {
    let registry = state.registry();
    let target = authz::authorize(
        &envelope.command,
        &envelope.lang_scope(),
        caller,
        registry.lifecycle(),
        &registry.list_languages(),
    )?;
    handlers::handle(state, caller, envelope, target).await
}

/// Handle one raw frame from `session`.
///
/// The caller is resolved per frame, so revoked credentials or a change of
/// active console apply from the next command on.
pub async fn handle_frame(state: &AppState, session: &Session, text: &str) -> CommandResult {
    let envelope = match CommandEnvelope::parse(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(session_id = %session.id, error = %e, "Rejected malformed command");
            let result = CommandResult::failure(e.to_string());
            state
                .hooks()
                .command_completed(CommandCompleted {
                    command: String::new(),
                    lang: None,
                    caller: session.login.clone().unwrap_or_else(|| "anonymous".into()),
                    status: false,
                    message: result.message.clone(),
                    elapsed_ms: 0,
                })
                .await;
            return result;
        }
    };

    match state.resolve_caller(session) {
        Ok(caller) => dispatch(state, &caller, envelope).await,
        Err(err) => {
            let result = err.into_result(&envelope);
            state
                .hooks()
                .command_completed(CommandCompleted {
                    command: envelope.command.clone(),
                    lang: envelope.lang.clone(),
                    caller: session.login.clone().unwrap_or_default(),
                    status: false,
                    message: result.message.clone(),
                    elapsed_ms: 0,
                })
                .await;
            result
        }
    }
}
