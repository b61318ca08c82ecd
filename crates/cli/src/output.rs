use colored::Colorize;
use conductor_core::{ResultNode, ResultTree, RunReport, Status};
use events::{Event, EventEnvelope};

/// One progress line per event, or `None` for events not worth showing.
pub fn progress_line(envelope: &EventEnvelope) -> Option<String> {
    let time = envelope.timestamp.format("%H:%M:%S");
    let line = match &envelope.event {
        Event::StepStarted { step, stage } => {
            format!("{} {} {} {}", time, "▶".cyan(), step.bold(), stage.as_str())
        }
        Event::StepFinished {
            step,
            stage,
            exceptions,
        } => {
            let mark = if *exceptions == 0 {
                "✓".green()
            } else {
                "✗".red()
            };
            format!("{} {} {} {} ({} exceptions)", time, mark, step.bold(), stage.as_str(), exceptions)
        }
        Event::TargetFinished {
            action,
            target,
            stage,
            success,
            error,
        } => match (success, error) {
            (true, _) => format!("{}   {} {} {} {}", time, "✓".green(), action, target, stage.as_str()),
            (false, error) => format!(
                "{}   {} {} {} {}: {}",
                time,
                "✗".red(),
                action,
                target,
                stage.as_str(),
                error.as_deref().unwrap_or("failed")
            ),
        },
        Event::StepSkipped { parent, step, reason } => {
            format!("{} {} {} in {} ({})", time, "⏭".yellow(), step, parent, reason)
        }
        Event::MonitorResolved {
            monitor,
            state,
            elapsed_ms,
        } => format!("{}   {} {} after {}ms", time, monitor.dimmed(), state, elapsed_ms),
        Event::Error { message, .. } => format!("{} {} {}", time, "!".red(), message),
        Event::MonitorPolled { .. } => return None,
    };
    Some(line)
}

fn status_label(status: Status) -> String {
    match status {
        Status::Pass => status.as_str().green().to_string(),
        Status::Fail => status.as_str().red().to_string(),
        Status::CantVerify => status.as_str().yellow().to_string(),
    }
}

fn render_tree(tree: &ResultTree, depth: usize, out: &mut Vec<String>) {
    let indent = "  ".repeat(depth);
    for (key, node) in tree.iter() {
        match node {
            ResultNode::Status(status) => {
                out.push(format!("{}{}: {}", indent, key, status_label(*status)));
            }
            ResultNode::Tree(subtree) => {
                out.push(format!("{}{}:", indent, key.bold()));
                render_tree(subtree, depth + 1, out);
            }
        }
    }
}

/// Human-readable report.
pub fn render_report(report: &RunReport) -> String {
    let mut lines = vec![String::new(), "Results".bold().to_string()];
    if report.results.is_empty() {
        lines.push("  (none)".to_string());
    } else {
        render_tree(&report.results, 1, &mut lines);
    }

    if !report.exceptions.is_empty() {
        lines.push(String::new());
        lines.push(format!("Exceptions ({})", report.exceptions.len()).red().bold().to_string());
        for exception in &report.exceptions {
            lines.push(format!("  - {}", exception));
        }
    }

    lines.push(String::new());
    lines.push(format!(
        "{} passed, {} failed, {} can't verify, {} exceptions",
        report.summary.pass,
        report.summary.fail,
        report.summary.cant_verify,
        report.exceptions.len()
    ));
    lines.join("\n")
}
