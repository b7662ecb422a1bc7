use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliVerb {
    Check,
    Run,
    Stop,
    Health,
    Send,
    RunTask,
    Help,
    Unknown,
}

pub fn parse_cli_verb(input: &str) -> CliVerb {
    match input {
        "check" => CliVerb::Check,
        "run" => CliVerb::Run,
        "stop" => CliVerb::Stop,
        "health" => CliVerb::Health,
        "send" => CliVerb::Send,
        "run-task" => CliVerb::RunTask,
        "help" | "--help" | "-h" => CliVerb::Help,
        _ => CliVerb::Unknown,
    }
}

/// Arguments after global flags have been taken out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliArgs {
    pub config: Option<PathBuf>,
    pub rest: Vec<String>,
}

/// Pulls `--config <path>` (or `--config=<path>`) out of `args`, wherever it
/// appears.
pub fn parse_global_args(args: Vec<String>) -> Result<CliArgs, String> {
    let mut parsed = CliArgs::default();
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let value = iter
                .next()
                .ok_or_else(|| "`--config` requires a path".to_string())?;
            parsed.config = Some(PathBuf::from(value));
        } else if let Some(value) = arg.strip_prefix("--config=") {
            if value.is_empty() {
                return Err("`--config` requires a path".to_string());
            }
            parsed.config = Some(PathBuf::from(value));
        } else {
            parsed.rest.push(arg);
        }
    }
    Ok(parsed)
}

pub fn cli_help_lines() -> Vec<String> {
    vec![
        "Usage: groupclaw [--config <path>] <command>".to_string(),
        String::new(),
        "Commands:".to_string(),
        "  check                       Run the startup gate and probe both backends".to_string(),
        "  run                         Serve inbox and IPC traffic until stopped".to_string(),
        "  stop                        Ask a running instance to shut down".to_string(),
        "  health                      Write and print a health snapshot".to_string(),
        "  send <group> <text...>      Queue a chat message for a group".to_string(),
        "  run-task <task-id>          Queue one run of a scheduled task".to_string(),
    ]
}

pub(crate) fn help_text() -> String {
    cli_help_lines().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn config_flag_is_accepted_anywhere() {
        let parsed = parse_global_args(args(&["check", "--config", "/etc/gc.yaml"])).expect("parse");
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/gc.yaml")));
        assert_eq!(parsed.rest, args(&["check"]));

        let parsed = parse_global_args(args(&["--config=/tmp/x.yaml", "run"])).expect("parse");
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/x.yaml")));
        assert_eq!(parsed.rest, args(&["run"]));

        assert!(parse_global_args(args(&["run", "--config"])).is_err());
    }

    #[test]
    fn verbs_map_to_commands() {
        assert_eq!(parse_cli_verb("check"), CliVerb::Check);
        assert_eq!(parse_cli_verb("run-task"), CliVerb::RunTask);
        assert_eq!(parse_cli_verb("start"), CliVerb::Unknown);
    }
}
