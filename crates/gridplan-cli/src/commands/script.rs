//! Script command implementation.

use anyhow::{Context, Result};
use console::style;
use std::fs;

use super::common::{JobArgs, build_request, load_planner, print_warnings, submission_context};

/// Execute the script command.
pub fn execute(config: Option<&str>, job: &JobArgs, output: Option<&str>) -> Result<()> {
    let planner = load_planner(config)?;
    let request = build_request(job, planner.options())?;

    let context = submission_context().with_tool_version(env!("CARGO_PKG_VERSION"));
    let plan = planner
        .plan(&request, &context)
        .with_context(|| format!("Cannot plan job {}", request.name))?;

    print_warnings(&plan.warnings);

    match output {
        Some(path) => {
            fs::write(path, &plan.script)
                .with_context(|| format!("Failed to write file: {path}"))?;
            eprintln!(
                "{} Wrote {} for queue {}",
                style("✓").green().bold(),
                style(path).green(),
                style(&plan.queue).yellow()
            );
        }
        None => print!("{}", plan.script),
    }

    Ok(())
}
