use super::*;
use clap::CommandFactory;
use shipit_installer::{ErrorKind, InstallPhase, RelaunchReport};

use crate::render::{format_result_lines, phase_label, render_status_line, OutputStyle};

fn sample_result(status: InstallStatus) -> ResultMessage {
    ResultMessage {
        txid: Some("tx-1".to_string()),
        status,
        final_bundle_path: "/Applications/Demo.app".to_string(),
        error_kind: None,
        error_detail: None,
        backup_path: None,
        relaunch: None,
    }
}

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn install_parses_flags() {
    let cli = Cli::try_parse_from([
        "shipit",
        "--socket",
        "/tmp/shipit.sock",
        "install",
        "/Applications/Demo.app",
        "/tmp/Demo.app",
        "--relaunch",
    ])
    .expect("install args parse");

    assert_eq!(cli.socket.as_deref(), Some(Path::new("/tmp/shipit.sock")));
    match cli.command {
        Commands::Install {
            target,
            staged,
            relaunch,
            survive_disconnect,
            json,
        } => {
            assert_eq!(target, PathBuf::from("/Applications/Demo.app"));
            assert_eq!(staged, PathBuf::from("/tmp/Demo.app"));
            assert!(relaunch);
            assert!(!survive_disconnect);
            assert!(!json);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn install_requires_both_paths() {
    assert!(Cli::try_parse_from(["shipit", "install", "/Applications/Demo.app"]).is_err());
}

#[test]
fn relative_paths_are_made_absolute() {
    let resolved = absolute_path(Path::new("Demo.app")).expect("absolute path");
    assert!(resolved.is_absolute());
    assert!(resolved.ends_with("Demo.app"));
    assert_eq!(
        absolute_path(Path::new("/Applications/Demo.app")).expect("absolute path"),
        PathBuf::from("/Applications/Demo.app")
    );
}

#[test]
fn parent_components_are_resolved_locally() {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let root = std::env::temp_dir()
        .join(format!("shipit-cli-tests-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(root.join("sub")).expect("must create test dirs");
    let root = std::fs::canonicalize(&root).expect("must resolve test root");

    let resolved = absolute_path(&root.join("sub/../Demo.app")).expect("absolute path");
    assert_eq!(resolved, root.join("Demo.app"));

    let _ = std::fs::remove_dir_all(&root);
}

#[test]
fn render_status_line_plain_is_unadorned() {
    assert_eq!(
        render_status_line(OutputStyle::Plain, "ok", "installed /Applications/Demo.app"),
        "installed /Applications/Demo.app"
    );
}

#[test]
fn render_status_line_rich_includes_ascii_badge() {
    assert_eq!(
        render_status_line(OutputStyle::Rich, "err", "failed"),
        "[ERR] failed"
    );
    assert_eq!(
        render_status_line(OutputStyle::Rich, "warn", "rolled back"),
        "[WARN] rolled back"
    );
}

#[test]
fn success_result_lines() {
    let lines = format_result_lines(&sample_result(InstallStatus::Success), OutputStyle::Rich);
    assert_eq!(
        lines,
        vec![
            "[OK] installed /Applications/Demo.app".to_string(),
            "txid: tx-1".to_string(),
        ]
    );
}

#[test]
fn failed_result_lines_name_kind_and_backup() {
    let mut result = sample_result(InstallStatus::Failed);
    result.error_kind = Some(ErrorKind::RollbackFailure);
    result.error_detail = Some("rename failed".to_string());
    result.backup_path = Some("/Applications/.Demo.app.shipit-backup-tx-1".to_string());

    let lines = format_result_lines(&result, OutputStyle::Plain);
    assert_eq!(
        lines[0],
        "failed /Applications/Demo.app: RollbackFailure: rename failed"
    );
    assert!(lines.contains(&"backup left at /Applications/.Demo.app.shipit-backup-tx-1".to_string()));
}

#[test]
fn rejected_request_without_path_renders_placeholder() {
    let mut result = sample_result(InstallStatus::Failed);
    result.txid = None;
    result.final_bundle_path = String::new();
    result.error_kind = Some(ErrorKind::ProtocolError);

    let lines = format_result_lines(&result, OutputStyle::Plain);
    assert_eq!(lines, vec!["failed <unknown bundle>: ProtocolError".to_string()]);
}

#[test]
fn relaunch_outcome_is_reported() {
    let mut result = sample_result(InstallStatus::RolledBack);
    result.error_kind = Some(ErrorKind::VerificationFailed);
    result.relaunch = Some(RelaunchReport {
        pid: None,
        error: Some("relaunch denied: no session".to_string()),
    });

    let lines = format_result_lines(&result, OutputStyle::Rich);
    assert_eq!(
        lines[0],
        "[WARN] rolled back /Applications/Demo.app (VerificationFailed)"
    );
    assert_eq!(
        lines.last().map(String::as_str),
        Some("[WARN] relaunch failed: relaunch denied: no session")
    );
}

#[test]
fn phase_labels_are_human_readable() {
    assert_eq!(phase_label(InstallPhase::BackingUp), "backing up");
    assert_eq!(phase_label(InstallPhase::RollingBack), "rolling back");
}

#[test]
fn completions_mention_binary_name() {
    for shell in [
        CliCompletionShell::Bash,
        CliCompletionShell::Zsh,
        CliCompletionShell::Fish,
        CliCompletionShell::Powershell,
    ] {
        let mut output = Vec::new();
        write_completions_script(shell, &mut output).expect("completions render");
        let script = String::from_utf8(output).expect("utf-8 script");
        assert!(script.contains("shipit"), "{shell:?}");
    }
}
