//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - queue matching and Slurm submission planning",
        style("Gridplan").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Components:");
    println!("  gridplan-sched  Capability model, queue matcher and script synthesis");
    println!("  gridplan-cli    Command-line interface");
    println!();
    println!(
        "Repository: {}",
        style("https://github.com/gridplan/gridplan").underlined()
    );
    println!("License:    {}", style("Apache-2.0").dim());
}
