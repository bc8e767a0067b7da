//! Shared helpers for CLI commands.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use tracing::debug;

use gridplan_sched::units::{to_canonical_memory, to_canonical_time};
use gridplan_sched::{
    ArraySpec, ArrayTasks, CoprocessorRequest, JobRequest, MemoryRequest, PlanWarning, Planner,
    PlannerOptions, SubmissionContext, TimeFormat,
};

/// Environment variable listing the modules loaded in the current shell.
const LOADED_MODULES_VAR: &str = "LOADEDMODULES";

/// Job resource options shared by `plan` and `script`.
#[derive(Args, Debug, Clone, Default)]
pub struct JobArgs {
    /// Job name (defaults to the command or task file name)
    #[arg(short = 'N', long)]
    pub name: Option<String>,

    /// Number of slots (CPUs) per task
    #[arg(short, long, default_value = "1")]
    pub slots: u32,

    /// Memory for the job, e.g. 20 or 20G (bare numbers use the configured unit)
    #[arg(short = 'R', long)]
    pub jobram: Option<String>,

    /// Interpret --jobram as memory per slot
    #[arg(long)]
    pub ram_per_slot: bool,

    /// Wall-clock time in minutes or as D-HH:MM:SS
    #[arg(short = 'T', long)]
    pub jobtime: Option<String>,

    /// Submit to this queue
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Only consider queues in this group
    #[arg(long)]
    pub group: Option<u32>,

    /// Coprocessor type, e.g. cuda
    #[arg(long)]
    pub coprocessor: Option<String>,

    /// Coprocessor class
    #[arg(long)]
    pub coprocessor_class: Option<String>,

    /// Number of coprocessors
    #[arg(long, default_value = "1")]
    pub coprocessor_multi: u32,

    /// Only accept the exact coprocessor class requested
    #[arg(long)]
    pub coprocessor_class_strict: bool,

    /// Toolkit module to load for the coprocessor, e.g. cuda/12.2
    #[arg(long)]
    pub coprocessor_toolkit: Option<String>,

    /// Run the slots as separate tasks on one node (MPI style)
    #[arg(long)]
    pub parallel_env: bool,

    /// File of commands, one array task per line
    #[arg(short = 't', long)]
    pub array_task: Option<String>,

    /// Run the command as an array job: n, n-m or n-m:s
    #[arg(long)]
    pub array_native: Option<String>,

    /// Maximum array tasks running at once
    #[arg(short = 'x', long)]
    pub array_limit: Option<u32>,

    /// Hold until these jobs complete
    #[arg(short = 'j', long, value_delimiter = ',')]
    pub jobhold: Vec<String>,

    /// Hold each array task on the same task of these array jobs
    #[arg(long, value_delimiter = ',')]
    pub array_hold: Vec<String>,

    /// Mail address for notifications
    #[arg(short = 'M', long)]
    pub mailto: Option<String>,

    /// Mail mode (b, e, a, f, n)
    #[arg(short = 'm', long)]
    pub mailoptions: Option<String>,

    /// Environment variable to export (NAME or NAME=value)
    #[arg(long)]
    pub export: Vec<String>,

    /// Project or account to charge
    #[arg(short = 'P', long)]
    pub project: Option<String>,

    /// Directory for log files (/dev/null discards them)
    #[arg(short = 'l', long)]
    pub logdir: Option<String>,

    /// Extra generic resource, e.g. scratch:10
    #[arg(short = 'r', long)]
    pub resource: Vec<String>,

    /// Do not ask the scheduler to enforce the memory request
    #[arg(long)]
    pub no_ram_limit: bool,

    /// Do not ask the scheduler to enforce the time request
    #[arg(long)]
    pub no_time_limit: bool,

    /// Do not requeue the job after node failure
    #[arg(long)]
    pub no_requeue: bool,

    /// Command to run
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Load the cluster configuration and build a planner.
pub fn load_planner(config: Option<&str>) -> Result<Planner> {
    let path = config.ok_or_else(|| {
        anyhow::anyhow!("No cluster configuration given (use --config or GRIDPLAN_CONFIG)")
    })?;

    if !Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {path}");
    }

    let source =
        fs::read_to_string(path).with_context(|| format!("Failed to read file: {path}"))?;

    let planner = Planner::from_yaml_str(&source)
        .with_context(|| format!("Invalid configuration: {path}"))?;
    debug!(
        "Loaded {} queue(s) from {}",
        planner.model().queues().len(),
        path
    );
    Ok(planner)
}

/// Build a job request from command-line options.
pub fn build_request(args: &JobArgs, options: &PlannerOptions) -> Result<JobRequest> {
    let mut request = match args.array_task {
        Some(ref path) => {
            if !args.command.is_empty() {
                anyhow::bail!("Give either an array task file or a command, not both");
            }
            JobRequest::from_task_file(path, count_tasks(path)?)
        }
        None => {
            if args.command.is_empty() {
                anyhow::bail!("No command given");
            }
            JobRequest::new(args.command.iter().cloned())
        }
    };

    request = request
        .with_name(args.name.clone().unwrap_or_else(|| default_name(args)))
        .with_slots(args.slots)
        .with_notify_memory(!args.no_ram_limit)
        .with_notify_time(!args.no_time_limit)
        .with_include_more_capable(!args.coprocessor_class_strict)
        .with_requeueable(!args.no_requeue)
        .with_parallel_env(args.parallel_env);

    if let Some(ref ram) = args.jobram {
        let megabytes = to_canonical_memory(ram, options.ram_units)?;
        request = request.with_memory(if args.ram_per_slot {
            MemoryRequest::per_slot(megabytes)
        } else {
            MemoryRequest::total(megabytes)
        });
    }

    if let Some(ref time) = args.jobtime {
        request = request.with_time(to_canonical_time(time, TimeFormat::Minutes)?);
    }

    if let Some(ref name) = args.coprocessor {
        let mut copro = CoprocessorRequest::new(name).with_quantity(args.coprocessor_multi);
        if let Some(ref class) = args.coprocessor_class {
            copro = copro.with_class(class);
        }
        if let Some(ref toolkit) = args.coprocessor_toolkit {
            copro = copro.with_toolkit_module(toolkit);
        }
        request = request.with_coprocessor(copro);
    }

    let is_array = args.array_task.is_some() || args.array_native.is_some();
    if is_array {
        let tasks: ArrayTasks = match args.array_native {
            Some(ref spec) => spec.parse()?,
            None => ArrayTasks::Count(1),
        };
        let mut array = ArraySpec::new(tasks);
        if let Some(limit) = args.array_limit {
            array = array.with_limit(limit);
        }
        for parent in &args.array_hold {
            array = array.with_hold(parent);
        }
        request = request.with_array(array);
    } else if args.array_limit.is_some() || !args.array_hold.is_empty() {
        anyhow::bail!("Array limits and array holds need --array-task or --array-native");
    }

    for hold in &args.jobhold {
        request = request.with_hold(hold);
    }
    if let Some(ref address) = args.mailto {
        request = request.with_mail(address, args.mailoptions.as_deref());
    }
    for var in &args.export {
        request = request.with_export(var);
    }
    if let Some(ref project) = args.project {
        request = request.with_project(project);
    }
    if let Some(ref queue) = args.queue {
        request = request.with_queue(queue);
    }
    if let Some(group) = args.group {
        request = request.with_group(group);
    }
    for resource in &args.resource {
        request = request.with_resource(resource);
    }
    if let Some(ref dir) = args.logdir {
        request = request.with_log_dir(dir);
    }

    Ok(request)
}

/// Count the commands in an array task file.
pub fn count_tasks(path: &str) -> Result<u32> {
    let source =
        fs::read_to_string(path).with_context(|| format!("Failed to read task file: {path}"))?;
    let lines = source.lines().count();
    if lines == 0 {
        anyhow::bail!("Array task file is empty: {path}");
    }
    u32::try_from(lines).with_context(|| format!("Too many tasks in {path}"))
}

/// Job name from the command or task file.
fn default_name(args: &JobArgs) -> String {
    let source = args
        .array_task
        .as_deref()
        .or_else(|| args.command.first().map(String::as_str))
        .unwrap_or("gridplan_job");
    Path::new(source)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(source)
        .to_string()
}

/// Describe the submitting session.
pub fn submission_context() -> SubmissionContext {
    let modules = parse_loaded_modules(std::env::var(LOADED_MODULES_VAR).ok().as_deref());
    let command_line = std::env::args().collect::<Vec<_>>().join(" ");

    let mut context = SubmissionContext::now()
        .with_command_line(command_line)
        .with_modules(modules);
    if let Ok(dir) = std::env::current_dir() {
        context = context.with_working_dir(dir.display().to_string());
    }
    context
}

/// Split a colon-separated module list.
pub fn parse_loaded_modules(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(':')
        .filter(|m| !m.trim().is_empty())
        .map(String::from)
        .collect()
}

/// Print plan warnings to stderr.
pub fn print_warnings(warnings: &[PlanWarning]) {
    for warning in warnings {
        eprintln!("{} {}", style("Warning:").yellow().bold(), warning);
    }
}
