use console::{style, StyledObject, Term};
use eyre::WrapErr;
use tracing::*;

use crate::runner::{CaseReport, RunSummary, Status, WorkflowInfo, WorkflowSummary};

/// Reporter trait. The trait is based on the "template method" pattern.
/// Implement the on_xxx methods you are interested in; the runner calls them
/// in order as it works through the workflows.
#[async_trait::async_trait]
pub trait Reporter {
    /// Called before the first test case of a workflow runs.
    async fn on_workflow_start(&mut self, _workflow: &WorkflowInfo) -> eyre::Result<()> {
        Ok(())
    }

    /// Called once a test case has been executed, skipped or has failed.
    async fn on_case_end(&mut self, _workflow: &WorkflowInfo, _case: &CaseReport) -> eyre::Result<()> {
        Ok(())
    }

    /// Called after every test case of a workflow has been reported.
    async fn on_workflow_end(&mut self, _summary: &WorkflowSummary) -> eyre::Result<()> {
        Ok(())
    }

    /// Called once all workflows have finished.
    async fn on_run_end(&mut self, _summary: &RunSummary) -> eyre::Result<()> {
        Ok(())
    }
}

pub struct NullReporter;

#[async_trait::async_trait]
impl Reporter for NullReporter {}

/// Prints one line per test case and a summary per workflow.
pub struct ProgressReporter {
    terminal: Term,
    position: usize,
    name_width: usize,
}

impl Default for ProgressReporter {
    fn default() -> ProgressReporter {
        ProgressReporter::new()
    }
}

impl ProgressReporter {
    pub fn new() -> ProgressReporter {
        ProgressReporter {
            terminal: Term::stdout(),
            position: 0,
            name_width: 0,
        }
    }

    fn write(&self, s: impl AsRef<str>) -> eyre::Result<()> {
        self.terminal
            .write_line(s.as_ref())
            .wrap_err("failed to write to terminal")
    }
}

fn badge(status: Status) -> StyledObject<String> {
    let label = format!(" {:<4} ", status.as_ref().to_uppercase());
    match status {
        Status::Sent | Status::Pass => style(label).black().on_green(),
        Status::Skip => style(label).black().on_yellow(),
        Status::Diff => style(label).black().on_yellow().bold(),
        Status::Fail => style(label).white().on_red().bold(),
    }
}

fn counts(summary: &WorkflowSummary) -> String {
    let mut parts = Vec::new();
    for (status, label) in [
        (Status::Sent, "submitted"),
        (Status::Pass, "passed"),
        (Status::Diff, "different"),
        (Status::Skip, "skipped"),
        (Status::Fail, "failed"),
    ] {
        let count = summary.count(status);
        if count == 0 {
            continue;
        }
        let text = format!("{count} {label}");
        parts.push(match status {
            Status::Fail => style(text).red().to_string(),
            Status::Skip | Status::Diff => style(text).yellow().to_string(),
            Status::Sent | Status::Pass => style(text).green().to_string(),
        });
    }
    parts.push(format!("{} total", summary.cases.len()));
    parts.join(", ")
}

#[async_trait::async_trait]
impl Reporter for ProgressReporter {
    async fn on_workflow_start(&mut self, workflow: &WorkflowInfo) -> eyre::Result<()> {
        self.position = 0;
        self.name_width = workflow.testcases.iter().map(String::len).max().unwrap_or(0);
        self.write("")?;
        self.write(format!(
            "Suite: {}/{}",
            style(&workflow.suite).bold(),
            workflow.version
        ))?;
        self.write("")
    }

    async fn on_case_end(&mut self, workflow: &WorkflowInfo, case: &CaseReport) -> eyre::Result<()> {
        self.position += 1;
        let total = workflow.testcases.len();
        let width = total.to_string().len();
        let elapsed = match case.status {
            Status::Skip => String::new(),
            _ => style(format!("({} ms)", case.elapsed.as_millis())).dim().to_string(),
        };
        self.write(format!(
            " {:>width$}. {} {:<name_width$}  {elapsed}",
            self.position,
            badge(case.status),
            case.testcase,
            name_width = self.name_width,
        ))?;
        if !case.errors.is_empty() {
            self.write("")?;
            self.write(format!("    {}", style("Exception Raised:").bold()))?;
            for error in &case.errors {
                self.write(format!("      - {}", style(error).dim()))?;
            }
            self.write("")?;
        }
        Ok(())
    }

    async fn on_workflow_end(&mut self, summary: &WorkflowSummary) -> eyre::Result<()> {
        self.write("")?;
        self.write(format!("{:<12}{}", style("Tests:").bold(), counts(summary)))?;
        self.write(format!(
            "{:<12}{:.2} s",
            style("Time:").bold(),
            summary.elapsed.as_secs_f64()
        ))?;
        for error in &summary.errors {
            self.write(format!("{:<12}{}", style("Error:").red().bold(), error))?;
        }
        if let Some(directory) = &summary.output_directory {
            self.write(format!("{:<12}{}", style("Results:").bold(), directory.display()))?;
        }
        Ok(())
    }

    async fn on_run_end(&mut self, summary: &RunSummary) -> eyre::Result<()> {
        debug!("run finished in {:?}", summary.elapsed);
        self.write("")?;
        if summary.has_failures() {
            self.write(format!(
                "{} Ran all test suites with failures.",
                style("✘").red()
            ))?;
        } else {
            self.write(format!("{} Ran all test suites.", style("✓").green()))?;
        }
        self.write("")
    }
}
