//! Shell command execution inside a run container.

use std::sync::OnceLock;

use regex::Regex;

use berth_common::constants::VALID_USERNAME_PATTERN;
use berth_common::error::{BerthError, Result};
use berth_common::types::ContainerId;
use berth_core::api::{ContainerApi, ExecIo, ExecSpec};

use crate::context::RunContext;

/// Whether `user` is a safe system username.
pub fn valid_username(user: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(VALID_USERNAME_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(user))
}

/// Single-quotes `value` for `/bin/sh`.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// How a command is reported while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// A command the caller asked for; echoed in debug mode.
    User,
    /// Housekeeping issued by Berth itself.
    Service,
}

/// Runs `command` through `/bin/sh -c` and waits for it.
///
/// The user is applied only when it is a valid username; output goes to
/// the context's sinks, prefixed unless in tty mode.
///
/// # Errors
///
/// Returns [`BerthError::Command`] on a non-zero exit and
/// [`BerthError::Runtime`] if the exec cannot be run.
pub async fn exec_command(
    api: &dyn ContainerApi,
    container: &ContainerId,
    ctx: &RunContext,
    command: &str,
    kind: CommandKind,
) -> Result<()> {
    let command = command.trim();
    if kind == CommandKind::User && ctx.is_debug() {
        ctx.say(&format!("CMD `{command}`\n"));
    }

    let user = ctx.user.clone().filter(|u| {
        let ok = valid_username(u);
        if !ok {
            tracing::warn!(user = %u, "ignoring invalid username");
        }
        ok
    });
    let spec = ExecSpec {
        container: container.clone(),
        command: vec!["/bin/sh".into(), "-c".into(), command.to_string()],
        user,
        working_dir: ctx.workdir.clone().filter(|w| !w.is_empty()),
        privileged: ctx.privileged,
        tty: ctx.tty,
    };
    let io = ExecIo {
        stdout: ctx.stdout_writer(),
        stderr: ctx.stderr_writer(),
        stdin: ctx.stdin.clone(),
    };

    tracing::debug!(container = %container, command, ?kind, "exec");
    let exit_code = api.exec(&spec, io).await?;
    if exit_code != 0 {
        return Err(BerthError::Command {
            command: command.to_string(),
            container: container.to_string(),
            exit_code,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use berth_core::api::CreateSpec;
    use berth_core::mock::{MockApi, MockCall};

    use super::*;
    use crate::context::{MemorySink, sink};

    #[test]
    fn usernames() {
        for ok in ["builder", "_svc", "ci-user", "a1_b2", "machine$"] {
            assert!(valid_username(ok), "{ok}");
        }
        for bad in ["", "Root", "1abc", "a b", "x;rm -rf /", "a".repeat(40).as_str()] {
            assert!(!valid_username(bad), "{bad}");
        }
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/work/it's"), r"'/work/it'\''s'");
    }

    async fn container(api: &MockApi) -> ContainerId {
        api.create_container(&CreateSpec::default()).await.expect("create")
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_command_error() {
        let api = Arc::new(MockApi::new());
        let id = container(&api).await;
        api.fail_command("false", 1);
        let err = exec_command(api.as_ref(), &id, &RunContext::default(), "  false ", CommandKind::User)
            .await
            .expect_err("must fail");
        assert!(
            matches!(err, BerthError::Command { ref command, exit_code: 1, .. } if command == "false"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn invalid_user_is_dropped_and_debug_echoes() {
        let api = MockApi::new();
        let id = container(&api).await;
        let out = MemorySink::new();
        let mut ctx = RunContext::with_sinks(sink(out.clone()), sink(std::io::sink()));
        ctx.user = Some("Not Valid".into());
        ctx.workdir = Some(String::new());
        ctx.debug = true;
        ctx.prefix = "[t] ".into();
        api.command_output("echo hi", "hi\n");

        exec_command(&api, &id, &ctx, "echo hi", CommandKind::User).await.expect("exec");
        assert_eq!(out.contents(), "[t] CMD `echo hi`\n[t] hi\n");

        let spec = api
            .calls()
            .into_iter()
            .find_map(|c| match c {
                MockCall::Exec(spec) => Some(spec),
                _ => None,
            })
            .expect("exec call");
        assert_eq!(spec.command, vec!["/bin/sh", "-c", "echo hi"]);
        assert!(spec.user.is_none());
        assert!(spec.working_dir.is_none());
    }

    #[tokio::test]
    async fn service_commands_are_not_echoed() {
        let api = MockApi::new();
        let id = container(&api).await;
        let out = MemorySink::new();
        let mut ctx = RunContext::with_sinks(sink(out.clone()), sink(std::io::sink()));
        ctx.debug = true;
        exec_command(&api, &id, &ctx.as_root(), "mkdir -p /x", CommandKind::Service)
            .await
            .expect("exec");
        assert!(out.contents().is_empty());
        assert_eq!(api.exec_commands(), vec!["mkdir -p /x"]);
    }
}
