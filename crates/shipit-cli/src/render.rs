use std::io::IsTerminal;
use std::time::{Duration, Instant};

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use shipit_installer::{InstallPhase, InstallStatus};
use shipit_service::ResultMessage;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn current_output_style() -> OutputStyle {
    let no_color = std::env::var_os("NO_COLOR").is_some_and(|value| !value.is_empty());
    if !no_color && std::io::stdout().is_terminal() {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct TerminalRenderer {
    style: OutputStyle,
}

/// Spinner tracking install phases as they stream in from the service.
pub(crate) struct PhaseProgress {
    progress_bar: Option<ProgressBar>,
    last_phase: Option<InstallPhase>,
    started_at: Instant,
}

impl TerminalRenderer {
    pub(crate) fn current() -> Self {
        Self {
            style: current_output_style(),
        }
    }

    pub(crate) fn print_status(self, status: &str, message: &str) {
        println!("{}", render_status_line(self.style, status, message));
    }

    pub(crate) fn print_lines(self, lines: &[String]) {
        for line in lines {
            println!("{line}");
        }
    }

    pub(crate) fn print_result(self, result: &ResultMessage) {
        self.print_lines(&format_result_lines(result, self.style));
    }

    pub(crate) fn start_phase_progress(self, label: &str) -> PhaseProgress {
        let progress_bar = if self.style == OutputStyle::Rich {
            let progress_bar = ProgressBar::new_spinner();
            if let Ok(style) =
                ProgressStyle::with_template("{spinner:.cyan.bold} {msg:<12} {elapsed}")
            {
                progress_bar.set_style(style.tick_chars(".oO@* "));
            }
            progress_bar.set_message(label.to_string());
            progress_bar.enable_steady_tick(Duration::from_millis(80));
            Some(progress_bar)
        } else {
            None
        };

        PhaseProgress {
            progress_bar,
            last_phase: None,
            started_at: Instant::now(),
        }
    }
}

impl PhaseProgress {
    pub(crate) fn set_phase(&mut self, phase: InstallPhase) {
        self.last_phase = Some(phase);
        match &self.progress_bar {
            Some(progress_bar) => progress_bar.set_message(phase_label(phase).to_string()),
            None => println!("{}", phase_label(phase)),
        }
    }

    pub(crate) fn finish(mut self) {
        let Some(progress_bar) = self.progress_bar.take() else {
            return;
        };
        progress_bar.finish_and_clear();
        if let Some(phase) = self.last_phase {
            println!(
                "{} in {}",
                colorize(phase_style(), phase_label(phase)),
                format_elapsed(self.started_at.elapsed())
            );
        }
    }

    pub(crate) fn abandon(mut self) {
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }
}

pub(crate) fn phase_label(phase: InstallPhase) -> &'static str {
    match phase {
        InstallPhase::Idle => "waiting",
        InstallPhase::BackingUp => "backing up",
        InstallPhase::Installing => "installing",
        InstallPhase::Verifying => "verifying",
        InstallPhase::Committed => "committed",
        InstallPhase::RollingBack => "rolling back",
        InstallPhase::RolledBack => "rolled back",
        InstallPhase::Failed => "failed",
    }
}

pub(crate) fn render_status_line(style: OutputStyle, status: &str, message: &str) -> String {
    match style {
        OutputStyle::Plain => message.to_string(),
        OutputStyle::Rich => {
            let badge = match status {
                "ok" => "[OK]",
                "warn" => "[WARN]",
                "err" => "[ERR]",
                _ => "[..]",
            };
            format!("{badge} {message}")
        }
    }
}

pub(crate) fn format_result_lines(result: &ResultMessage, style: OutputStyle) -> Vec<String> {
    let path = if result.final_bundle_path.is_empty() {
        "<unknown bundle>"
    } else {
        result.final_bundle_path.as_str()
    };
    let detail = match (&result.error_kind, &result.error_detail) {
        (Some(kind), Some(detail)) => format!("{kind}: {detail}"),
        (Some(kind), None) => kind.to_string(),
        (None, Some(detail)) => detail.clone(),
        (None, None) => String::new(),
    };

    let mut lines = vec![match result.status {
        InstallStatus::Success => render_status_line(style, "ok", &format!("installed {path}")),
        InstallStatus::RolledBack if detail.is_empty() => {
            render_status_line(style, "warn", &format!("rolled back {path}"))
        }
        InstallStatus::RolledBack => {
            render_status_line(style, "warn", &format!("rolled back {path} ({detail})"))
        }
        InstallStatus::Failed => {
            render_status_line(style, "err", &format!("failed {path}: {detail}"))
        }
    }];

    if let Some(txid) = &result.txid {
        lines.push(format!("txid: {txid}"));
    }
    if let Some(backup) = &result.backup_path {
        lines.push(render_status_line(
            style,
            "warn",
            &format!("backup left at {backup}"),
        ));
    }
    if let Some(relaunch) = &result.relaunch {
        match (&relaunch.pid, &relaunch.error) {
            (_, Some(error)) => lines.push(render_status_line(
                style,
                "warn",
                &format!("relaunch failed: {error}"),
            )),
            (Some(pid), None) => lines.push(format!("relaunched pid {pid}")),
            (None, None) => {}
        }
    }
    lines
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let millis = elapsed.subsec_millis();
    format!("{secs}.{millis:03}s")
}

fn phase_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
