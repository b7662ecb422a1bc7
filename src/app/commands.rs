use crate::app::cli::{help_text, parse_cli_verb, parse_global_args, CliVerb};
use crate::config::{load_global_settings, load_settings, Settings};
use crate::ipc::{build_health_snapshot, write_health_snapshot};
use crate::queue::{submit, WorkItem};
use crate::registry::{GroupRecord, GroupRegistry, TaskStatus, TaskStore, TrustLevel};
use crate::runner::{validate_startup, BackendProbe, HostNativeRunner, IsolatedRunner};
use crate::runtime::{append_runtime_log, bootstrap, StatePaths};
use crate::shared::ids::{generate_run_id, GroupFolder};
use crate::shared::time::now_secs;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;

pub fn run_cli(args: Vec<String>) -> Result<String, String> {
    let args = parse_global_args(args)?;
    let Some(verb) = args.rest.first() else {
        return Ok(help_text());
    };
    let rest = &args.rest[1..];
    let config = args.config.as_deref();

    match parse_cli_verb(verb) {
        CliVerb::Check => cmd_check(config),
        CliVerb::Run => cmd_run(config),
        CliVerb::Stop => cmd_stop(config),
        CliVerb::Health => cmd_health(config),
        CliVerb::Send => cmd_send(config, rest),
        CliVerb::RunTask => cmd_run_task(config, rest),
        CliVerb::Help => Ok(help_text()),
        CliVerb::Unknown => Err(format!("unknown command `{verb}`\n\n{}", help_text())),
    }
}

fn load(config: Option<&Path>) -> Result<Settings, String> {
    match config {
        Some(path) => load_settings(path),
        None => load_global_settings(),
    }
    .map_err(|e| e.to_string())
}

/// Registered groups, plus the configured main group when startup would
/// still have to seed it.
fn groups_for_gate(settings: &Settings, registry: &GroupRegistry) -> Result<Vec<GroupRecord>, String> {
    let mut groups = registry.all().map_err(|e| e.to_string())?;
    if let Some(main) = &settings.main_group {
        if !groups.iter().any(GroupRecord::is_main) {
            groups.push(GroupRecord {
                id: main.id.clone(),
                name: main.name.clone().unwrap_or_else(|| main.id.clone()),
                folder: GroupFolder::parse(&main.folder)?,
                trust: TrustLevel::Main,
                execution_mode: main.execution_mode,
                trigger: String::new(),
                security: None,
                added_at: 0,
            });
        }
    }
    Ok(groups)
}

pub fn cmd_check(config: Option<&Path>) -> Result<String, String> {
    let settings = load(config)?;
    let paths = StatePaths::new(&settings.state_root);
    let registry = GroupRegistry::new(&paths.root);
    let groups = groups_for_gate(&settings, &registry)?;
    validate_startup(&settings, &groups).map_err(|e| e.to_string())?;

    let isolated = IsolatedRunner::new(&settings, paths.clone());
    let host_native = HostNativeRunner::from_process_env(&settings, paths.clone());
    let report = BackendProbe::new(&isolated, &host_native).probe(&settings, &groups);

    let mut lines = vec![
        "startup gate passed".to_string(),
        format!("default_mode={}", settings.default_mode),
        format!("groups={}", groups.len()),
    ];
    for backend in &report.backends {
        lines.push(format!(
            "backend.{}={}{}",
            backend.mode,
            if backend.available { "available" } else { "unavailable" },
            backend
                .detail
                .as_deref()
                .map(|detail| format!(" ({detail})"))
                .unwrap_or_default()
        ));
    }
    if report.all_unavailable() {
        return Err(format!("{}\nno execution backend is available", lines.join("\n")));
    }
    if report.is_degraded() {
        lines.push(format!("degraded_groups={}", report.affected_groups.join(",")));
    }
    Ok(lines.join("\n"))
}

pub fn cmd_run(config: Option<&Path>) -> Result<String, String> {
    let settings = load(config)?;
    let mut runtime = bootstrap(settings).map_err(|e| e.to_string())?;
    let report = runtime
        .run(&AtomicBool::new(false))
        .map_err(|e| e.to_string())?;
    Ok(format!(
        "stopped\nsignalled={}\nforce_killed={}\nabandoned={}",
        report.signalled, report.force_killed, report.abandoned
    ))
}

pub fn cmd_stop(config: Option<&Path>) -> Result<String, String> {
    let settings = load(config)?;
    let paths = StatePaths::new(&settings.state_root);
    let stop_path = paths.stop_signal_path();
    if let Some(parent) = stop_path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("{}: {e}", parent.display()))?;
    }
    fs::write(&stop_path, now_secs().to_string())
        .map_err(|e| format!("{}: {e}", stop_path.display()))?;
    append_runtime_log(&paths, "info", "runtime.stop.requested", "stop file written");
    Ok(format!("stop requested\nstop_file={}", stop_path.display()))
}

pub fn cmd_health(config: Option<&Path>) -> Result<String, String> {
    let settings = load(config)?;
    let paths = StatePaths::new(&settings.state_root);
    let registry = GroupRegistry::new(&paths.root);
    let groups = registry.all().map_err(|e| e.to_string())?;
    let isolated = IsolatedRunner::new(&settings, paths.clone());
    let host_native = HostNativeRunner::from_process_env(&settings, paths.clone());
    let backends = BackendProbe::new(&isolated, &host_native).backend_health();
    let snapshot = build_health_snapshot(&settings, &groups, backends);

    let rendered = serde_json::to_string_pretty(&snapshot).map_err(|e| e.to_string())?;
    match groups.iter().find(|group| group.is_main()) {
        Some(main) => {
            let path = write_health_snapshot(&paths, main.folder.as_str(), &snapshot)
                .map_err(|e| e.to_string())?;
            Ok(format!("{rendered}\nsnapshot={}", path.display()))
        }
        None => Ok(rendered),
    }
}

pub fn cmd_send(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let [group_id, text @ ..] = args else {
        return Err("usage: send <group> <text...>".to_string());
    };
    if text.is_empty() {
        return Err("usage: send <group> <text...>".to_string());
    }
    let settings = load(config)?;
    let paths = StatePaths::new(&settings.state_root);
    if GroupRegistry::new(&paths.root)
        .get(group_id)
        .map_err(|e| e.to_string())?
        .is_none()
    {
        return Err(format!("group `{group_id}` is not registered"));
    }
    let id = generate_run_id(now_secs()).replacen("run-", "cli-", 1);
    let item = WorkItem::message(&id, group_id, &text.join(" "));
    let path = submit(&paths, &item).map_err(|e| e.to_string())?;
    Ok(format!("queued\nitem={id}\nfile={}", path.display()))
}

pub fn cmd_run_task(config: Option<&Path>, args: &[String]) -> Result<String, String> {
    let [task_id] = args else {
        return Err("usage: run-task <task-id>".to_string());
    };
    let settings = load(config)?;
    let paths = StatePaths::new(&settings.state_root);
    let task = TaskStore::new(&paths.root)
        .get(task_id)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("task `{task_id}` not found"))?;
    if task.status != TaskStatus::Active {
        return Err(format!("task `{task_id}` is not active"));
    }
    let id = generate_run_id(now_secs()).replacen("run-", "task-run-", 1);
    let item = WorkItem::task(&id, &task.group_id, &task.id, &task.prompt);
    let path = submit(&paths, &item).map_err(|e| e.to_string())?;
    Ok(format!("queued\nitem={id}\nfile={}", path.display()))
}
