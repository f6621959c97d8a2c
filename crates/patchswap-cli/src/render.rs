use std::io::IsTerminal;
use std::time::Duration;

use anstyle::{AnsiColor, Effects, Style};
use indicatif::{ProgressBar, ProgressStyle};
use patchswap_applier::{ApplyOutcome, FinalizeOutcome, RelaunchOutcome, WaitOutcome};
use patchswap_core::{UpdateManifestDocument, UpdateState};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum OutputStyle {
    Plain,
    Rich,
}

pub(crate) fn resolve_output_style(stdout_is_tty: bool, _stderr_is_tty: bool) -> OutputStyle {
    if stdout_is_tty {
        OutputStyle::Rich
    } else {
        OutputStyle::Plain
    }
}

pub(crate) fn current_output_style() -> OutputStyle {
    resolve_output_style(
        std::io::stdout().is_terminal(),
        std::io::stderr().is_terminal(),
    )
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

pub(crate) fn print_section(style: OutputStyle, title: &str) {
    if style == OutputStyle::Rich {
        println!("{}", colorize(section_style(), &format!("== {title} ==")));
    }
}

pub(crate) fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{line}");
    }
}

/// Spinner shown while polling; `None` in plain mode.
pub(crate) fn start_wait_spinner(style: OutputStyle, label: &str) -> Option<ProgressBar> {
    if style != OutputStyle::Rich {
        return None;
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::with_template("{spinner:.cyan.bold} {msg} {elapsed_precise}")
    {
        spinner.set_style(template.tick_chars(".oO@* "));
    }
    spinner.set_message(colorize(label_style(), label));
    spinner.enable_steady_tick(Duration::from_millis(80));
    Some(spinner)
}

pub(crate) fn format_apply_outcome_lines(outcome: &ApplyOutcome, style: OutputStyle) -> Vec<String> {
    match outcome {
        ApplyOutcome::Applied(result) => {
            let mut lines = vec![render_status_line(
                style,
                "ok",
                &format!(
                    "applied update: applied={} skipped={} resumed={} removed={}",
                    result.applied_count,
                    result.skipped_count,
                    result.resumed_count,
                    result.removed.len()
                ),
            )];
            lines.push(render_status_line(
                style,
                "step",
                &format!("log: {}", result.log_path.display()),
            ));
            lines
        }
        ApplyOutcome::AlreadyDone(state) => vec![render_status_line(
            style,
            "step",
            &format!("nothing to apply (status={state})"),
        )],
        ApplyOutcome::Discarded => vec![render_status_line(
            style,
            "warn",
            "discarded update older than the installed application",
        )],
        ApplyOutcome::Failed { code, message } => vec![render_status_line(
            style,
            "err",
            &format!("apply failed (code={code}): {message}"),
        )],
    }
}

pub(crate) fn format_finalize_outcome_lines(
    outcome: &FinalizeOutcome,
    style: OutputStyle,
) -> Vec<String> {
    let line = match outcome {
        FinalizeOutcome::Finalized(state) => {
            let status = if state.as_state() == UpdateState::Succeeded {
                "ok"
            } else {
                "err"
            };
            render_status_line(style, status, &format!("finalized update (status={state})"))
        }
        FinalizeOutcome::AlreadyTerminal(state) => render_status_line(
            style,
            "step",
            &format!("update already finalized (status={state})"),
        ),
        FinalizeOutcome::NotReady(state) => render_status_line(
            style,
            "warn",
            &format!("update not ready to finalize (status={})", state_label(*state)),
        ),
        FinalizeOutcome::Blocked => render_status_line(
            style,
            "warn",
            "install root is still held; finalize deferred",
        ),
    };
    vec![line]
}

pub(crate) fn format_wait_outcome_line<T>(
    outcome: &WaitOutcome<T>,
    style: OutputStyle,
    describe: impl Fn(&T) -> String,
) -> String {
    match outcome {
        WaitOutcome::Ready(value) => render_status_line(style, "ok", &describe(value)),
        WaitOutcome::TimedOut => render_status_line(style, "warn", "timed out waiting"),
        WaitOutcome::Cancelled => render_status_line(style, "warn", "wait cancelled"),
    }
}

pub(crate) fn format_relaunch_outcome_line(outcome: &RelaunchOutcome, style: OutputStyle) -> String {
    match outcome {
        RelaunchOutcome::Exited(exit) => match exit.code {
            Some(0) => render_status_line(style, "ok", "application exited (code=0)"),
            Some(code) => {
                render_status_line(style, "warn", &format!("application exited (code={code})"))
            }
            None => render_status_line(style, "warn", "application terminated by signal"),
        },
        RelaunchOutcome::TimedOut => {
            render_status_line(style, "warn", "application timed out and was killed")
        }
        RelaunchOutcome::Cancelled => {
            render_status_line(style, "warn", "relaunch cancelled and application killed")
        }
    }
}

pub(crate) fn format_status_lines(
    state: Option<UpdateState>,
    manifest: &UpdateManifestDocument,
    style: OutputStyle,
) -> Vec<String> {
    let mut lines = vec![render_status_line(
        style,
        "step",
        &format!("status: {}", state_label(state)),
    )];
    match &manifest.active {
        Some(active) => {
            lines.push(render_status_line(
                style,
                "step",
                &format!(
                    "active: {} (patch=updates/{} attempts={})",
                    active.name, active.patch.index, active.attempts
                ),
            ));
            if let Some(resolution) = &active.resolution {
                let mode = if resolution.used_alternate {
                    "alternate"
                } else {
                    "in-place"
                };
                lines.push(render_status_line(
                    style,
                    "step",
                    &format!(
                        "target: {} ({mode})",
                        resolution.effective_root.display()
                    ),
                ));
            }
        }
        None => lines.push(render_status_line(style, "step", "active: none")),
    }
    for record in &manifest.history {
        lines.push(render_status_line(
            style,
            "step",
            &format!("history: {} ({})", record.name, record.state),
        ));
    }
    lines
}

fn state_label(state: Option<UpdateState>) -> String {
    state
        .map(|state| state.as_status_token())
        .unwrap_or_else(|| "none".to_string())
}

fn section_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightBlue.into()))
        .effects(Effects::BOLD)
}

fn label_style() -> Style {
    Style::new()
        .fg_color(Some(AnsiColor::BrightCyan.into()))
        .effects(Effects::BOLD)
}

fn colorize(style: Style, text: &str) -> String {
    format!("{}{}{}", style.render(), text, style.render_reset())
}
