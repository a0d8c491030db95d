//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::engine::{DriftReport, RunReport};
use crate::planner::{NewValue, Plan, StepAction, StepStatus};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Step result row for table display.
#[derive(Tabled)]
struct StepResultRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    provider_id: String,
    #[tabled(rename = "Time")]
    duration: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "ID")]
    provider_id: String,
    #[tabled(rename = "Hash")]
    hash: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize + ?Sized>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    /// Formats a plan as text.
    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - infrastructure is up to date.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan\n");
        let _ = write!(
            output,
            "   Config hash: {}\n\n",
            ConfigHasher::short_hash(&plan.config_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| detailed || s.action != StepAction::NoOp)
            .map(|(i, s)| PlanStepRow {
                index: i + 1,
                action: Self::format_action(s.action, s.replacement),
                resource: s.resource.to_string(),
                reason: Self::truncate(&s.reason, 40),
            })
            .collect();

        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for step in plan.steps.iter().filter(|s| !s.changes.is_empty()) {
                let _ = writeln!(output, "\n   {} {}", step.action, step.resource);
                for change in &step.changes {
                    let old = change
                        .old_value
                        .as_ref()
                        .map_or_else(|| String::from("(none)"), ToString::to_string);
                    let new = match &change.new_value {
                        NewValue::Unknown(_) => change.new_value.to_string().dimmed().to_string(),
                        _ => change.new_value.to_string(),
                    };
                    let marker = if change.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "     {}: {old} -> {new}{marker}", change.field);
                }
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy\n",
            (plan.create_count() - plan.replace_count()).to_string().green(),
            plan.update_count().to_string().yellow(),
            plan.replace_count().to_string().magenta(),
            plan.delete_count().saturating_sub(plan.replace_count()).to_string().red()
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_run(&self, report: &RunReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let execution = &report.execution;
                let mut output = String::new();

                let rows: Vec<StepResultRow> = execution
                    .steps
                    .iter()
                    .filter(|s| s.action != StepAction::NoOp)
                    .map(|s| StepResultRow {
                        index: s.index + 1,
                        action: s.action.to_string(),
                        resource: s.resource.to_string(),
                        status: Self::format_status(s.status),
                        provider_id: s.provider_id.clone().unwrap_or_default(),
                        duration: format!("{}ms", s.duration_ms),
                    })
                    .collect();

                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                let failures: Vec<_> = execution.steps.iter().filter(|s| s.error.is_some()).collect();
                if !failures.is_empty() {
                    let _ = write!(output, "\n{} Errors:\n", "⚠".yellow());
                    for step in failures {
                        let _ = writeln!(
                            output,
                            "   - {}: {}",
                            step.resource,
                            step.error.as_deref().unwrap_or_default()
                        );
                    }
                }

                let status = if execution.success {
                    format!("{} Run complete", "✓".green())
                } else {
                    format!("{} Run incomplete", "✗".red())
                };
                let _ = write!(
                    output,
                    "\n{status}: {} applied, {} failed, {} skipped, {} cancelled, {} unchanged ({}ms)\n",
                    execution.applied.to_string().green(),
                    execution.failed.to_string().red(),
                    execution.skipped.to_string().yellow(),
                    execution.cancelled,
                    execution.noop,
                    execution.duration_ms
                );

                if !report.exports.is_empty() {
                    output.push('\n');
                    output.push_str(&Self::format_exports_text(&report.exports));
                }

                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                if !report.has_drift() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }

                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for entry in &report.drifted {
                    let _ = writeln!(
                        output,
                        "   - {} ({}): {}",
                        entry.resource, entry.provider_id, entry.kind
                    );
                }
                let _ = write!(
                    output,
                    "\n{}/{} resources have drifted.\n",
                    report.drifted.len(),
                    report.checked
                );
                output
            }
        }
    }

    /// Formats exported values.
    #[must_use]
    pub fn format_exports(&self, exports: &BTreeMap<String, serde_json::Value>) -> String {
        match self.format {
            OutputFormat::Json => Self::json(exports),
            OutputFormat::Text if exports.is_empty() => String::from("No exports recorded.\n"),
            OutputFormat::Text => Self::format_exports_text(exports),
        }
    }

    fn format_exports_text(exports: &BTreeMap<String, serde_json::Value>) -> String {
        let mut output = String::from("Exports:\n");
        for (name, value) in exports {
            let rendered = value
                .as_str()
                .map_or_else(|| value.to_string(), str::to_string);
            let _ = writeln!(output, "   {} = {rendered}", name.bold());
        }
        output
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                "warnings": result.warnings,
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid!", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {error}");
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats a state snapshot.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(
                    output,
                    "\nState: {}/{}\n\n",
                    state.project, state.environment
                );
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(
                    output,
                    "   Config hash: {}",
                    ConfigHasher::short_hash(&state.config_hash)
                );
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<RecordRow> = state
                        .resources
                        .iter()
                        .map(|(id, record)| RecordRow {
                            resource: id.to_string(),
                            provider_id: record.provider_id.clone(),
                            hash: ConfigHasher::short_hash(&record.properties_hash).to_string(),
                            updated: record.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓" } else { "✗" };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} applied, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.applied,
                            entry.failed,
                            entry.skipped
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    /// Formats an action with color.
    fn format_action(action: StepAction, replacement: bool) -> String {
        match (action, replacement) {
            (StepAction::Create, true) => "+create (replace)".magenta().to_string(),
            (StepAction::Delete, true) => "-delete (replace)".magenta().to_string(),
            (StepAction::Create, false) => "+create".green().to_string(),
            (StepAction::Update, _) => "~update".yellow().to_string(),
            (StepAction::Delete, false) => "-delete".red().to_string(),
            (StepAction::NoOp, _) => "noop".dimmed().to_string(),
        }
    }

    /// Formats a step status with color.
    fn format_status(status: StepStatus) -> String {
        match status {
            StepStatus::Applied => "applied".green().to_string(),
            StepStatus::Failed => "failed".red().to_string(),
            StepStatus::Skipped => "skipped".yellow().to_string(),
            StepStatus::Cancelled => "cancelled".yellow().to_string(),
            StepStatus::Pending | StepStatus::Running => status.to_string().dimmed().to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{head}...")
        }
    }

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": "success", "message": message })),
            OutputFormat::Text => format!("{} {message}", "✓".green()),
        }
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&serde_json::json!({ "status": "error", "message": message })),
            OutputFormat::Text => format!("{} {message}", "✗".red()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ResourceId;
    use crate::planner::PlanStep;

    fn plan() -> Plan {
        Plan {
            created_at: chrono::Utc::now(),
            config_hash: String::from("0123456789abcdef"),
            state_serial: 0,
            steps: vec![PlanStep {
                action: StepAction::Create,
                resource: ResourceId::new("bucket", "logs"),
                changes: Vec::new(),
                provider_id: None,
                replacement: false,
                reason: String::from("Resource does not exist"),
                dependencies: Vec::new(),
            }],
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_plan_text_lists_resources() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan(), false);
        assert!(text.contains("bucket.logs"));
        assert!(text.contains("+create"));
        assert!(text.contains("01234567"));
    }

    #[test]
    fn test_plan_json_is_machine_readable() {
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan(), false);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["steps"][0]["resource"], "bucket.logs");
    }

    #[test]
    fn test_empty_exports() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        assert!(formatter.format_exports(&BTreeMap::new()).contains("No exports"));
    }
}
