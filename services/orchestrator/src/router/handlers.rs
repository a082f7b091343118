//! One function per session command.

use std::collections::BTreeMap;

use babel_id::SessionId;
use babel_protocol::{commands, CommandEnvelope, CommandResult, LangScope, MediaMode, ProtocolError};
use serde_json::{json, Value};
use tracing::info;

use super::authz::{self, Target};
use crate::auth::Caller;
use crate::error::CommandError;
use crate::registry::Lifecycle;
use crate::state::AppState;

const DEFAULT_LOG_COUNT: usize = 100;

type HandlerResult = Result<CommandResult, CommandError>;

pub(super) async fn handle(
    state: &AppState,
    caller: &Caller,
    envelope: &CommandEnvelope,
    target: Target,
) -> HandlerResult {
    match envelope.command.as_str() {
        commands::GET_INFO => get_info(state, caller),
        commands::GET_LOGS => get_logs(state, envelope),
        commands::PULL_CONFIG => pull_config(state, target).await,
        commands::PUSH_CONFIG => push_config(state, target).await,
        commands::SET_SETTINGS => set_settings(state, envelope, target).await,
        commands::REMOVE_LANGUAGE => remove_language(state, envelope).await,
        commands::INITIALIZE => initialize(state).await,
        commands::DISPOSE => dispose(state).await,
        commands::INFRASTRUCTURE_LOCK => set_infrastructure_lock(state, true),
        commands::INFRASTRUCTURE_UNLOCK => set_infrastructure_lock(state, false),
        commands::SELECT_ACTIVE_CONSOLE => select_active_console(state, envelope),
        commands::PLAY_MEDIA => play_media(state, envelope, target).await,
        commands::STOP_MEDIA => Ok(state
            .fleet()
            .broadcast(&target.langs, commands::node::STOP_MEDIA, None)
            .await),
        commands::NODE_INFO => Ok(state
            .fleet()
            .broadcast(&target.langs, commands::node::GET_INFO, None)
            .await),
        commands::TIMING_SET => timing_set(state, envelope),
        commands::TIMING_START => timing_start(state, envelope),
        commands::TIMING_STOP => {
            let cancelled = state.timing().stop();
            Ok(CommandResult::ok(format!("timeline stopped, {cancelled} pending entries cancelled")))
        }
        commands::TIMING_GET => Ok(CommandResult::ok("timeline").with_object(json!({
            "entries": state.timing().entries(),
            "pending": state.timing().pending(),
        }))),
        commands::SAVE_SNAPSHOT => save_snapshot(state).await,
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn get_info(state: &AppState, caller: &Caller) -> HandlerResult {
    let registry = state.registry();
    let visible = authz::visible(caller, &registry.list_languages());

    let mut info = registry.snapshot();
    if let Some(Value::Object(languages)) = info.get_mut("languages") {
        languages.retain(|lang, _| visible.contains(lang));
    }
    let nodes: Vec<_> = state
        .fleet()
        .records()
        .into_iter()
        .filter(|n| visible.contains(&n.lang))
        .collect();
    info["nodes"] = json!(nodes);
    info["caller"] = json!(caller.describe());

    Ok(CommandResult::ok("server info").with_object(info))
}

fn get_logs(state: &AppState, envelope: &CommandEnvelope) -> HandlerResult {
    let count = match envelope.optional_detail("count") {
        Some(v) => v.as_u64().ok_or_else(|| ProtocolError::InvalidDetail {
            field: "count".into(),
            reason: "expected a non-negative integer".into(),
        })? as usize,
        None => DEFAULT_LOG_COUNT,
    };
    let records = state.registry().logs().tail(count);
    Ok(CommandResult::ok(format!("{} log records", records.len())).with_object(json!(records)))
}

async fn pull_config(state: &AppState, target: Target) -> HandlerResult {
    let importer = state.importer().ok_or(CommandError::NoConfigSource)?;
    let mut trees = importer.pull().await?;
    if !target.broad {
        trees.retain(|lang, _| target.langs.contains(lang));
    }
    let langs: Vec<String> = trees.keys().cloned().collect();

    let changed = state.registry().import(&trees)?;
    info!(langs = ?langs, changed, "Configuration imported");

    if state.registry().lifecycle() == Lifecycle::Sleeping {
        return wake(state).await;
    }
    Ok(state.activator().activate(&langs).await)
}

/// Leave `sleeping`: bring every language up, falling back on any failure.
async fn wake(state: &AppState) -> HandlerResult {
    let registry = state.registry();
    registry.begin_initialize()?;
    let transition = registry.guard_transition();

    let result = state.activator().activate(&registry.list_languages()).await;
    if result.status {
        transition.commit()?;
    } else {
        info!("Initialization failed, lifecycle reverted");
    }
    Ok(result)
}

async fn push_config(state: &AppState, target: Target) -> HandlerResult {
    let importer = state.importer().ok_or(CommandError::NoConfigSource)?;
    let registry = state.registry();
    let trees: BTreeMap<String, Value> = target
        .langs
        .iter()
        .filter_map(|lang| Some((lang.clone(), registry.language(lang)?.to_push_json())))
        .collect();
    let count = trees.len();
    importer.push(trees).await?;
    Ok(CommandResult::ok(format!("exported {count} languages")))
}

async fn set_settings(state: &AppState, envelope: &CommandEnvelope, target: Target) -> HandlerResult {
    let overlay = envelope
        .details
        .as_ref()
        .ok_or_else(|| ProtocolError::MissingDetail("settings".into()))?;
    if target.langs.is_empty() {
        return Err(CommandError::LanguageRequired(envelope.command.clone()));
    }

    state.registry().update_languages(&target.langs, overlay)?;
    Ok(state.activator().activate(&target.langs).await)
}

async fn remove_language(state: &AppState, envelope: &CommandEnvelope) -> HandlerResult {
    let LangScope::One(lang) = envelope.lang_scope() else {
        return Err(CommandError::LanguageRequired(envelope.command.clone()));
    };
    if !state.registry().contains(&lang) {
        return Err(CommandError::UnknownLanguage(lang));
    }

    let _round = state.activator().exclusive().await;
    state.fleet().disconnect(&lang);
    state.infrastructure().release(std::slice::from_ref(&lang)).await;
    state.registry().delete_language(&lang);
    Ok(CommandResult::ok(format!("removed {lang}")))
}

/// Re-push every language while running.
async fn initialize(state: &AppState) -> HandlerResult {
    let langs = state.registry().list_languages();
    Ok(state.activator().activate(&langs).await)
}

async fn dispose(state: &AppState) -> HandlerResult {
    let registry = state.registry();
    if registry.infrastructure_locked() {
        return Err(CommandError::InfrastructureLocked);
    }
    registry.begin_dispose()?;
    let transition = registry.guard_transition();

    {
        let _round = state.activator().exclusive().await;
        state.timing().stop();
        state.fleet().disconnect_all();
        for lang in registry.list_languages() {
            registry.deactivate_all(&lang);
        }
        state.infrastructure().release_all().await;
    }

    transition.commit()?;
    Ok(CommandResult::ok("disposed"))
}

fn set_infrastructure_lock(state: &AppState, locked: bool) -> HandlerResult {
    state.registry().set_infrastructure_locked(locked);
    info!(locked, "Infrastructure lock changed");
    let word = if locked { "locked" } else { "unlocked" };
    Ok(CommandResult::ok(format!("infrastructure {word}")))
}

fn select_active_console(state: &AppState, envelope: &CommandEnvelope) -> HandlerResult {
    let session = match envelope.optional_detail("session_id") {
        Some(raw) => Some(
            serde_json::from_value::<SessionId>(raw.clone()).map_err(|e| {
                ProtocolError::InvalidDetail {
                    field: "session_id".into(),
                    reason: e.to_string(),
                }
            })?,
        ),
        None => None,
    };
    state.registry().select_active_console(session);
    info!(session_id = ?session, "Active console selected");
    Ok(CommandResult::ok(match session {
        Some(id) => format!("active console is {id}"),
        None => "active console cleared".to_string(),
    }))
}

async fn play_media(state: &AppState, envelope: &CommandEnvelope, target: Target) -> HandlerResult {
    let name = envelope.detail_str("name")?;
    let mode = match envelope.optional_detail("mode") {
        Some(Value::String(mode)) => mode.parse::<MediaMode>()?,
        Some(_) => {
            return Err(ProtocolError::InvalidDetail {
                field: "mode".into(),
                reason: "expected a string".into(),
            }
            .into())
        }
        None => MediaMode::default(),
    };

    Ok(state
        .fleet()
        .broadcast(
            &target.langs,
            commands::node::RUN_MEDIA,
            Some(json!({ "name": name, "mode": mode })),
        )
        .await)
}

fn timing_set(state: &AppState, envelope: &CommandEnvelope) -> HandlerResult {
    let entries: Vec<(String, f64)> = serde_json::from_value(envelope.detail("entries")?.clone())
        .map_err(|e| ProtocolError::InvalidDetail {
            field: "entries".into(),
            reason: e.to_string(),
        })?;
    let count = state
        .timing()
        .set(entries)
        .map_err(|e| ProtocolError::InvalidDetail {
            field: "entries".into(),
            reason: e.to_string(),
        })?;
    Ok(CommandResult::ok(format!("timeline has {count} entries")))
}

fn timing_start(state: &AppState, envelope: &CommandEnvelope) -> HandlerResult {
    let offset = match envelope.optional_detail("offset") {
        Some(v) => v.as_f64().ok_or_else(|| ProtocolError::InvalidDetail {
            field: "offset".into(),
            reason: "expected seconds".into(),
        })?,
        None => 0.0,
    };
    let scheduled = state
        .timing()
        .start(offset)
        .map_err(|e| ProtocolError::InvalidDetail {
            field: "offset".into(),
            reason: e.to_string(),
        })?;
    Ok(CommandResult::ok(format!("timeline started, {scheduled} entries scheduled")))
}

async fn save_snapshot(state: &AppState) -> HandlerResult {
    state
        .snapshots()
        .save(
            &state.registry().persisted(),
            &state.infrastructure().topology(),
            &state.fleet().records(),
        )
        .await?;
    Ok(CommandResult::ok(format!(
        "snapshot written to {}",
        state.snapshots().dir().display()
    )))
}
