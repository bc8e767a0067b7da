//! Plan command implementation.

use anyhow::{Context, Result};
use console::style;

use gridplan_sched::SubmissionPlan;
use gridplan_sched::units::{ceil_minutes, format_slurm_time};

use super::common::{JobArgs, build_request, load_planner, print_warnings, submission_context};

/// Execute the plan command.
pub fn execute(config: Option<&str>, job: &JobArgs, json: bool) -> Result<()> {
    let planner = load_planner(config)?;
    let request = build_request(job, planner.options())?;

    let context = submission_context().with_tool_version(env!("CARGO_PKG_VERSION"));
    let plan = planner
        .plan(&request, &context)
        .with_context(|| format!("Cannot plan job {}", request.name))?;

    if json {
        println!("{}", plan.to_json()?);
        return Ok(());
    }

    print_summary(&plan);
    print_warnings(&plan.warnings);

    Ok(())
}

/// Print a human-readable plan.
fn print_summary(plan: &SubmissionPlan) {
    println!(
        "{} Queue {} (group {})",
        style("✓").green().bold(),
        style(&plan.queue).green(),
        plan.group
    );
    if !plan.alternatives.is_empty() {
        println!("  Alternatives: {}", plan.alternatives.join(", "));
    }
    println!("  Slots:        {}", plan.slots);
    if plan.memory_mb > 0 {
        println!(
            "  Memory:       {} MB ({} MB per slot)",
            plan.memory_mb, plan.memory_per_slot_mb
        );
    }
    if let Some(seconds) = plan.time_limit {
        println!(
            "  Time:         {} ({} min)",
            format_slurm_time(seconds),
            ceil_minutes(seconds)
        );
    }
    if !plan.coprocessor.is_empty() {
        let tokens: Vec<String> = plan.coprocessor.iter().map(ToString::to_string).collect();
        println!("  Coprocessor:  {}", tokens.join(" "));
    }

    println!();
    println!("{}", style("Directives:").bold());
    for line in plan.directive_lines() {
        println!("  {}", style(line).dim());
    }
}
