//! Command authorization: lifecycle gate, then caller permissions.

use babel_protocol::{commands, LangScope};

use crate::auth::{Caller, Permissions};
use crate::error::CommandError;
use crate::registry::Lifecycle;

/// Commands that only admins (and the orchestrator itself) may issue.
const ADMIN_ONLY: &[&str] = &[
    commands::PULL_CONFIG,
    commands::PUSH_CONFIG,
    commands::REMOVE_LANGUAGE,
    commands::INITIALIZE,
    commands::DISPOSE,
    commands::INFRASTRUCTURE_LOCK,
    commands::INFRASTRUCTURE_UNLOCK,
    commands::SELECT_ACTIVE_CONSOLE,
    commands::TIMING_SET,
    commands::TIMING_START,
    commands::TIMING_STOP,
    commands::TIMING_GET,
    commands::SAVE_SNAPSHOT,
];

/// Commands addressed to one or more languages.
const LANG_SCOPED: &[&str] = &[
    commands::PULL_CONFIG,
    commands::PUSH_CONFIG,
    commands::SET_SETTINGS,
    commands::REMOVE_LANGUAGE,
    commands::PLAY_MEDIA,
    commands::STOP_MEDIA,
    commands::NODE_INFO,
];

const WHILE_SLEEPING: &[&str] = &[
    commands::PULL_CONFIG,
    commands::GET_INFO,
    commands::INFRASTRUCTURE_UNLOCK,
    commands::GET_LOGS,
];

const WHILE_TRANSITIONING: &[&str] = &[commands::GET_INFO];

/// The languages an authorized command may act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub langs: Vec<String>,
    /// The request named no single language.
    pub broad: bool,
}

pub fn check_lifecycle(command: &str, lifecycle: Lifecycle) -> Result<(), CommandError> {
    let allowed = match lifecycle {
        Lifecycle::Running => return Ok(()),
        Lifecycle::Sleeping => WHILE_SLEEPING,
        Lifecycle::Initializing | Lifecycle::Disposing => WHILE_TRANSITIONING,
    };
    if allowed.contains(&command) {
        Ok(())
    } else {
        Err(CommandError::LifecycleDenied {
            command: command.to_string(),
            lifecycle,
        })
    }
}

/// Authorize `command` for `caller` and resolve its language scope.
///
/// `known` is the registry's language list, used for broad requests.
pub fn authorize(
    command: &str,
    scope: &LangScope,
    caller: &Caller,
    lifecycle: Lifecycle,
    known: &[String],
) -> Result<Target, CommandError> {
    if !commands::ALL.contains(&command) {
        return Err(CommandError::UnknownCommand(command.to_string()));
    }
    check_lifecycle(command, lifecycle)?;

    if *caller == Caller::Anonymous && command != commands::GET_INFO {
        return Err(CommandError::Unauthenticated);
    }
    if ADMIN_ONLY.contains(&command) && !caller.is_admin() {
        return Err(CommandError::AdminRequired(command.to_string()));
    }

    let broad = scope.is_broad();
    if !LANG_SCOPED.contains(&command) {
        return Ok(Target {
            langs: Vec::new(),
            broad,
        });
    }

    let requested: Vec<String> = match scope {
        LangScope::One(lang) => vec![lang.clone()],
        LangScope::All | LangScope::Unspecified => known.to_vec(),
    };

    let langs = adjust_langs(command, scope, caller, requested)?;
    Ok(Target { langs, broad })
}

fn adjust_langs(
    command: &str,
    scope: &LangScope,
    caller: &Caller,
    requested: Vec<String>,
) -> Result<Vec<String>, CommandError> {
    match caller {
        Caller::Internal
        | Caller::User {
            permissions: Permissions::Admin | Permissions::All,
            ..
        } => Ok(requested),
        Caller::ActiveConsole if command == commands::PLAY_MEDIA => Ok(requested),
        Caller::ActiveConsole | Caller::Anonymous => match scope {
            LangScope::One(lang) => Err(CommandError::LanguageDenied(lang.clone())),
            _ => Ok(Vec::new()),
        },
        Caller::User {
            permissions: Permissions::Langs(allowed),
            ..
        } => match scope {
            LangScope::One(lang) if !allowed.contains(lang) => {
                Err(CommandError::LanguageDenied(lang.clone()))
            }
            _ => Ok(requested
                .into_iter()
                .filter(|l| allowed.contains(l))
                .collect()),
        },
    }
}

/// Languages whose state `caller` may see in `get info`.
pub fn visible(caller: &Caller, known: &[String]) -> Vec<String> {
    match caller {
        Caller::Internal | Caller::ActiveConsole => known.to_vec(),
        Caller::Anonymous => Vec::new(),
        Caller::User { permissions, .. } => match permissions {
            Permissions::Admin | Permissions::All => known.to_vec(),
            Permissions::Langs(allowed) => known
                .iter()
                .filter(|l| allowed.contains(*l))
                .cloned()
                .collect(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn known() -> Vec<String> {
        ["Deu", "Fra", "Ita"].map(String::from).to_vec()
    }

    fn user(langs: &[&str]) -> Caller {
        Caller::User {
            login: "op".into(),
            permissions: Permissions::Langs(langs.iter().map(|l| l.to_string()).collect()),
        }
    }

    fn admin() -> Caller {
        Caller::User {
            login: "root".into(),
            permissions: Permissions::Admin,
        }
    }

    #[rstest]
    #[case(Lifecycle::Sleeping, commands::PULL_CONFIG, true)]
    #[case(Lifecycle::Sleeping, commands::GET_LOGS, true)]
    #[case(Lifecycle::Sleeping, commands::INFRASTRUCTURE_UNLOCK, true)]
    #[case(Lifecycle::Sleeping, commands::SET_SETTINGS, false)]
    #[case(Lifecycle::Sleeping, commands::INFRASTRUCTURE_LOCK, false)]
    #[case(Lifecycle::Sleeping, commands::INITIALIZE, false)]
    #[case(Lifecycle::Sleeping, commands::GET_INFO, true)]
    #[case(Lifecycle::Initializing, commands::GET_INFO, true)]
    #[case(Lifecycle::Initializing, commands::GET_LOGS, false)]
    #[case(Lifecycle::Disposing, commands::PLAY_MEDIA, false)]
    #[case(Lifecycle::Running, commands::DISPOSE, true)]
    fn lifecycle_gate(#[case] lifecycle: Lifecycle, #[case] command: &str, #[case] allowed: bool) {
        assert_eq!(check_lifecycle(command, lifecycle).is_ok(), allowed);
    }

    #[test]
    fn exactly_four_commands_run_while_sleeping() {
        let mut allowed: Vec<&str> = commands::ALL
            .iter()
            .copied()
            .filter(|c| check_lifecycle(c, Lifecycle::Sleeping).is_ok())
            .collect();
        allowed.sort_unstable();
        assert_eq!(
            allowed,
            vec![
                commands::GET_INFO,
                commands::GET_LOGS,
                commands::INFRASTRUCTURE_UNLOCK,
                commands::PULL_CONFIG,
            ]
        );
    }

    #[test]
    fn unknown_command_is_rejected_first() {
        let err = authorize("reboot", &LangScope::All, &admin(), Lifecycle::Sleeping, &known())
            .unwrap_err();
        assert!(matches!(err, CommandError::UnknownCommand(_)));
    }

    #[test]
    fn user_outside_permissions_is_denied() {
        let err = authorize(
            commands::SET_SETTINGS,
            &LangScope::One("Ita".into()),
            &user(&["Fra"]),
            Lifecycle::Running,
            &known(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "LanguageDenied: Ita");
    }

    #[test]
    fn broad_request_is_intersected() {
        let target = authorize(
            commands::STOP_MEDIA,
            &LangScope::All,
            &user(&["Fra", "Ita", "Jpn"]),
            Lifecycle::Running,
            &known(),
        )
        .unwrap();
        assert_eq!(target.langs, vec!["Fra".to_string(), "Ita".to_string()]);
        assert!(target.broad);
    }

    #[test]
    fn active_console_may_only_play_media() {
        let play = authorize(
            commands::PLAY_MEDIA,
            &LangScope::All,
            &Caller::ActiveConsole,
            Lifecycle::Running,
            &known(),
        )
        .unwrap();
        assert_eq!(play.langs, known());

        let stop = authorize(
            commands::STOP_MEDIA,
            &LangScope::All,
            &Caller::ActiveConsole,
            Lifecycle::Running,
            &known(),
        )
        .unwrap();
        assert!(stop.langs.is_empty());

        let err = authorize(
            commands::SET_SETTINGS,
            &LangScope::One("Fra".into()),
            &Caller::ActiveConsole,
            Lifecycle::Running,
            &known(),
        )
        .unwrap_err();
        assert!(matches!(err, CommandError::LanguageDenied(_)));
    }

    #[rstest]
    #[case(Caller::Anonymous, commands::GET_INFO, true)]
    #[case(Caller::Anonymous, commands::PLAY_MEDIA, false)]
    #[case(Caller::ActiveConsole, commands::SAVE_SNAPSHOT, false)]
    #[case(user(&["Fra"]), commands::DISPOSE, false)]
    #[case(admin(), commands::DISPOSE, true)]
    #[case(Caller::Internal, commands::TIMING_START, true)]
    fn caller_gate(#[case] caller: Caller, #[case] command: &str, #[case] allowed: bool) {
        let result = authorize(command, &LangScope::Unspecified, &caller, Lifecycle::Running, &known());
        assert_eq!(result.is_ok(), allowed);
    }

    #[test]
    fn visibility_follows_permissions() {
        assert_eq!(visible(&user(&["Fra"]), &known()), vec!["Fra".to_string()]);
        assert!(visible(&Caller::Anonymous, &known()).is_empty());
        assert_eq!(visible(&admin(), &known()), known());
    }
}
