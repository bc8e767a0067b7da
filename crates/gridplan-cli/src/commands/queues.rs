//! Queues command implementation.

use anyhow::Result;
use console::style;

use gridplan_sched::units::format_slurm_time;
use gridplan_sched::{CapabilityModel, QueueDefinition};

use super::common::load_planner;

/// Execute the queues command.
pub fn execute(config: Option<&str>, json: bool) -> Result<()> {
    let planner = load_planner(config)?;
    let model = planner.model();

    if json {
        println!("{}", serde_json::to_string_pretty(model)?);
        return Ok(());
    }

    println!("{} Configured queues:\n", style("Gridplan").cyan().bold());
    for (group, queues) in model.groups() {
        println!("  {}", style(format!("Group {group}")).bold());
        for queue in queues {
            print_queue(queue);
        }
        println!();
    }

    print_coprocessors(model);

    Ok(())
}

fn print_queue(queue: &QueueDefinition) {
    let marker = if queue.default {
        style("●").green()
    } else {
        style("○").dim()
    };
    println!(
        "  {} {} (priority {}){}",
        marker,
        style(queue.name.to_string()).bold(),
        queue.priority,
        if queue.name.is_compound() {
            " compound"
        } else {
            ""
        }
    );
    println!("    Time:      {}", format_slurm_time(queue.time_limit));
    println!("    Memory:    {} MB", queue.max_size);
    println!("    Slots:     {}", queue.max_slots);
    if let Some(size) = queue.slot_size {
        println!("    Slot size: {size} MB");
    }
    for (name, copro) in &queue.coprocessors {
        let classes = if copro.classes.is_empty() {
            String::new()
        } else {
            format!(" [{}]", copro.classes.join(", "))
        };
        println!("    {}: up to {}{}", name, copro.max_quantity, classes);
    }
}

fn print_coprocessors(model: &CapabilityModel) {
    let mut coprocessors = model.coprocessors().peekable();
    if coprocessors.peek().is_none() {
        return;
    }

    println!("{} Coprocessors:\n", style("Gridplan").cyan().bold());
    for copro in coprocessors {
        println!(
            "  {} (resource {})",
            style(&copro.name).bold(),
            copro.resource
        );
        for class in copro.classes() {
            let default = copro.default_class.as_deref() == Some(class.selector.as_str());
            println!(
                "    {} {:<4} {:<8} capability {}{}",
                if default {
                    style("●").green()
                } else {
                    style("○").dim()
                },
                class.selector,
                class.resource,
                class.capability.0,
                if class.doc.is_empty() {
                    String::new()
                } else {
                    format!("  {}", class.doc.trim())
                }
            );
        }
        println!();
    }
}
