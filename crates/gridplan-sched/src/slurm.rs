//! Slurm submission plans and wrapper scripts.

use std::path::Path;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::PlannerOptions;
use crate::coprocessor::CoprocessorToken;
use crate::error::{PlanResult, PlanWarning};
use crate::matcher::QueueMatch;
use crate::request::{ArrayTasks, JobRequest, Payload};
use crate::units::{format_slurm_time, split_across_slots};

/// Prefix of every directive line in a batch script.
pub const DIRECTIVE_PREFIX: &str = "#SBATCH";

/// Log file location that discards output.
const DISCARD_LOGS: &str = "/dev/null";

/// Kind of job dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    /// Start after the parents complete successfully.
    AfterOk,
    /// Start each array task after the same task of the parents.
    AfterCorr,
}

impl DependencyKind {
    fn keyword(&self) -> &'static str {
        match self {
            DependencyKind::AfterOk => "afterok",
            DependencyKind::AfterCorr => "aftercorr",
        }
    }
}

/// One dependency condition on a set of parent jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dependency {
    pub kind: DependencyKind,
    pub parents: Vec<String>,
}

impl Dependency {
    fn new(kind: DependencyKind, parents: &[String]) -> Self {
        Self {
            kind,
            parents: parents.iter().map(|p| p.replace('.', "_")).collect(),
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.keyword(), self.parents.join(":"))
    }
}

/// A single `#SBATCH` option. Variants are declared in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "directive", content = "value", rename_all = "snake_case")]
pub enum Directive {
    JobName(String),
    Partition(Vec<String>),
    NodeList(Vec<String>),
    Account(String),
    CpusPerTask(u32),
    NtasksPerNode(u32),
    /// Megabytes per slot.
    MemoryPerCpu(u64),
    /// Seconds.
    Time(u64),
    Gres(Vec<String>),
    Constraint(Vec<String>),
    Array {
        tasks: ArrayTasks,
        limit: Option<u32>,
    },
    Dependency(Vec<Dependency>),
    MailUser(String),
    MailType(Vec<String>),
    Output(String),
    Error(String),
    Export(Vec<String>),
    Chdir(String),
    Requeue,
}

impl Directive {
    /// Render as `sbatch` command-line arguments.
    pub fn render(&self) -> String {
        match self {
            Directive::JobName(name) => format!("--job-name={name}"),
            Directive::Partition(partitions) => format!("-p {}", partitions.join(",")),
            Directive::NodeList(hosts) => format!("-w {}", hosts.join(",")),
            Directive::Account(account) => format!("--account={account}"),
            Directive::CpusPerTask(slots) => format!("--cpus-per-task={slots}"),
            Directive::NtasksPerNode(tasks) => format!("--ntasks-per-node={tasks}"),
            Directive::MemoryPerCpu(mb) => format!("--mem-per-cpu={mb}"),
            Directive::Time(seconds) => format!("--time={}", format_slurm_time(*seconds)),
            Directive::Gres(resources) => format!("--gres={}", resources.join(",")),
            Directive::Constraint(features) => format!("--constraint=\"{}\"", features.join("|")),
            Directive::Array { tasks, limit } => match limit {
                Some(limit) => format!("--array={tasks}%{limit}"),
                None => format!("--array={tasks}"),
            },
            Directive::Dependency(conditions) => {
                let conditions: Vec<String> = conditions.iter().map(|d| d.to_string()).collect();
                format!("--dependency={}", conditions.join(","))
            }
            Directive::MailUser(address) => format!("--mail-user={address}"),
            Directive::MailType(types) => format!("--mail-type={}", types.join(",")),
            Directive::Output(path) => format!("-o {}", shell_quote(path)),
            Directive::Error(path) => format!("-e {}", shell_quote(path)),
            Directive::Export(vars) => format!("--export={}", vars.join(",")),
            Directive::Chdir(dir) => format!("--chdir={dir}"),
            Directive::Requeue => "--requeue".to_string(),
        }
    }

    /// Render as a batch script line.
    pub fn line(&self) -> String {
        format!("{} {}", DIRECTIVE_PREFIX, self.render())
    }
}

/// Facts about the submitting session recorded in the script preamble.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionContext {
    pub submitted_at: NaiveDateTime,
    /// The command line as the user typed it.
    pub command_line: String,
    pub tool_version: String,
    /// Modules loaded in the submitting shell.
    pub loaded_modules: Vec<String>,
    /// Directory used for logs when the request names none.
    pub working_dir: Option<String>,
}

impl SubmissionContext {
    /// Context stamped with the current local time.
    pub fn now() -> Self {
        Self::at(Local::now().naive_local())
    }

    /// Context stamped with a fixed time.
    pub fn at(submitted_at: NaiveDateTime) -> Self {
        Self {
            submitted_at,
            command_line: String::new(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            loaded_modules: Vec::new(),
            working_dir: None,
        }
    }

    pub fn with_command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = command_line.into();
        self
    }

    pub fn with_tool_version(mut self, version: impl Into<String>) -> Self {
        self.tool_version = version.into();
        self
    }

    pub fn with_modules(mut self, modules: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.loaded_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Everything needed to submit a job, plus the decisions that led to it.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionPlan {
    /// Queue name as configured.
    pub queue: String,
    pub partitions: Vec<String>,
    pub hosts: Vec<String>,
    /// Fallback queues from the same group, best first.
    pub alternatives: Vec<String>,
    pub group: u32,
    pub slots: u32,
    pub memory_mb: u64,
    pub memory_per_slot_mb: u64,
    pub coprocessor: Vec<CoprocessorToken>,
    /// Requested wall-clock time in seconds.
    pub time_limit: Option<u64>,
    pub directives: Vec<Directive>,
    pub script: String,
    pub warnings: Vec<PlanWarning>,
}

impl SubmissionPlan {
    /// Directive lines in script order.
    pub fn directive_lines(&self) -> Vec<String> {
        self.directives.iter().map(Directive::line).collect()
    }

    /// `sbatch` arguments equivalent to the directives.
    pub fn sbatch_args(&self) -> Vec<String> {
        self.directives.iter().map(Directive::render).collect()
    }

    /// Serialize to pretty-printed JSON.
    pub fn to_json(&self) -> PlanResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Build the directives and wrapper script for a matched request.
pub fn build_plan(
    request: &JobRequest,
    matched: &QueueMatch<'_>,
    tokens: &[CoprocessorToken],
    options: &PlannerOptions,
    context: &SubmissionContext,
) -> PlanResult<SubmissionPlan> {
    let queue = matched.queue;
    let mut warnings = Vec::new();
    let mut directives = Vec::new();

    let job_name = sanitize_name(&request.name);
    directives.push(Directive::JobName(job_name.clone()));

    let partitions = queue.name.partitions();
    let hosts = queue.name.hosts();
    directives.push(Directive::Partition(partitions.clone()));
    if !hosts.is_empty() {
        directives.push(Directive::NodeList(hosts.clone()));
    }

    if let Some(ref project) = request.project {
        directives.push(Directive::Account(project.clone()));
    }

    directives.push(Directive::CpusPerTask(matched.slots));
    if request.parallel_env {
        directives.push(Directive::NtasksPerNode(matched.slots));
    }

    let memory_mb = request.total_memory();
    let memory_per_slot_mb = split_across_slots(memory_mb, matched.slots);
    if options.notify_ram_usage && request.notify_memory && request.memory.is_some() {
        directives.push(Directive::MemoryPerCpu(memory_per_slot_mb));
    }

    if let Some(time) = request.time {
        if options.set_time_limit && request.notify_time {
            directives.push(Directive::Time(time));
        }
    }

    let mut gres = Vec::new();
    let mut constraints = Vec::new();
    for token in tokens {
        match token {
            CoprocessorToken::Gres { .. } => gres.push(token.to_string()),
            CoprocessorToken::Constraint { alternatives } => {
                constraints.extend(alternatives.iter().cloned())
            }
        }
    }
    gres.extend(request.resources.iter().cloned());
    if !gres.is_empty() {
        directives.push(Directive::Gres(gres));
    }
    if !constraints.is_empty() {
        directives.push(Directive::Constraint(constraints));
    }

    let mut after_ok = request.holds.clone();
    let mut after_corr = Vec::new();

    if let Some(ref array) = request.array {
        let limit = match array.limit {
            Some(limit) if !options.array_limits => {
                warn!("Dropping array task limit {limit}: not supported by this cluster");
                warnings.push(PlanWarning::ArrayLimitUnsupported { limit });
                None
            }
            limit => limit,
        };
        directives.push(Directive::Array {
            tasks: array.tasks,
            limit,
        });

        if !array.hold.is_empty() {
            if options.array_holds {
                after_corr = array.hold.clone();
            } else {
                warn!(
                    "Holding on whole array job(s) {}: per-task holds not supported",
                    array.hold.join(",")
                );
                warnings.push(PlanWarning::ArrayHoldUnsupported {
                    parents: array.hold.clone(),
                });
                after_ok.extend(array.hold.iter().cloned());
            }
        }
    }

    let mut dependencies = Vec::new();
    if !after_ok.is_empty() {
        dependencies.push(Dependency::new(DependencyKind::AfterOk, &after_ok));
    }
    if !after_corr.is_empty() {
        dependencies.push(Dependency::new(DependencyKind::AfterCorr, &after_corr));
    }
    if !dependencies.is_empty() {
        directives.push(Directive::Dependency(dependencies));
    }

    if options.mail_support {
        if let Some(ref address) = request.mail_to {
            let mode = request.mail_mode.as_deref().unwrap_or(&options.mail_mode);
            let types = options.mail_types(mode)?;
            directives.push(Directive::MailUser(address.clone()));
            directives.push(Directive::MailType(types.to_vec()));
        }
    }

    let (output, error) = log_files(request, &job_name, context);
    directives.push(Directive::Output(output));
    directives.push(Directive::Error(error));

    let exports = export_list(request, options);
    directives.push(Directive::Export(exports.clone()));

    if let Some(ref dir) = request.work_dir {
        directives.push(Directive::Chdir(dir.clone()));
    }

    if request.requeueable {
        directives.push(Directive::Requeue);
    }

    let mut modules = Vec::new();
    if options.preserve_modules {
        modules.extend(context.loaded_modules.iter().cloned());
        let toolkit = request
            .coprocessor
            .as_ref()
            .and_then(|c| c.toolkit_module.as_ref());
        if let Some(toolkit) = toolkit {
            if !modules.contains(toolkit) {
                modules.push(toolkit.clone());
            }
        }
    }
    let script = generate_script(request, &directives, &exports, &modules, options, context);

    debug!(
        "Built plan for {} on {} with {} directive(s)",
        job_name,
        queue.name,
        directives.len()
    );

    Ok(SubmissionPlan {
        queue: queue.name.to_string(),
        partitions,
        hosts,
        alternatives: matched
            .alternatives
            .iter()
            .map(|q| q.name.to_string())
            .collect(),
        group: queue.group,
        slots: matched.slots,
        memory_mb,
        memory_per_slot_mb,
        coprocessor: tokens.to_vec(),
        time_limit: request.time,
        directives,
        script,
        warnings,
    })
}

/// Output and error log paths.
fn log_files(
    request: &JobRequest,
    job_name: &str,
    context: &SubmissionContext,
) -> (String, String) {
    let dir = request
        .log_dir
        .as_deref()
        .or(context.working_dir.as_deref())
        .unwrap_or(".");

    if dir == DISCARD_LOGS {
        return (DISCARD_LOGS.to_string(), DISCARD_LOGS.to_string());
    }

    let suffix = if request.is_array() { "%A.%a" } else { "%j" };
    let path = |stream: char| {
        Path::new(dir)
            .join(format!("{job_name}.{stream}{suffix}"))
            .display()
            .to_string()
    };
    (path('o'), path('e'))
}

/// Variables to export: `ALL`, the portable aliases, then the request's own.
fn export_list(request: &JobRequest, options: &PlannerOptions) -> Vec<String> {
    let prefix = &options.env_prefix;
    let aliases = [
        ("JOB_ID_VAR", "SLURM_JOB_ID"),
        ("ARRAYTASKID_VAR", "SLURM_ARRAY_TASK_ID"),
        ("ARRAYSTARTID_VAR", "SLURM_ARRAY_TASK_MIN"),
        ("ARRAYENDID_VAR", "SLURM_ARRAY_TASK_MAX"),
        ("ARRAYSTEPSIZE_VAR", "SLURM_ARRAY_TASK_STEP"),
        ("ARRAYCOUNT_VAR", "SLURM_ARRAY_TASK_COUNT"),
        ("NSLOTS", "SLURM_NPROCS"),
    ];

    let mut vars: Vec<String> = Vec::new();
    if options.copy_environment {
        vars.push("ALL".to_string());
    }

    let entries = aliases
        .iter()
        .map(|(name, value)| format!("{prefix}_{name}={value}"))
        .chain(request.export_vars.iter().cloned());

    for entry in entries {
        let entry = quote_value(&entry);
        let name = var_name(&entry);
        match vars.iter().position(|v| var_name(v) == name) {
            Some(index) => vars[index] = entry,
            None => vars.push(entry),
        }
    }
    vars
}

fn var_name(entry: &str) -> &str {
    entry.split_once('=').map_or(entry, |(name, _)| name)
}

/// Single-quote values containing separators `sbatch` would split on.
fn quote_value(entry: &str) -> String {
    let Some((name, value)) = entry.split_once('=') else {
        return entry.to_string();
    };
    let quoted = (value.starts_with('"') && value.ends_with('"') && value.len() > 1)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() > 1);
    if !quoted && (value.contains(',') || value.contains(' ')) {
        format!("{name}='{value}'")
    } else {
        entry.to_string()
    }
}

fn generate_script(
    request: &JobRequest,
    directives: &[Directive],
    exports: &[String],
    modules: &[String],
    options: &PlannerOptions,
    context: &SubmissionContext,
) -> String {
    let mut script = String::new();

    script.push_str(&format!("#!{}\n", options.shell));
    for directive in directives {
        script.push_str(&directive.line());
        script.push('\n');
    }
    script.push('\n');

    if !modules.is_empty() {
        for path in &options.add_module_paths {
            script.push_str(&format!("module use {path}\n"));
        }
        for module in modules {
            script.push_str(&format!("module load {module}\n"));
        }
    }

    let exported: Vec<&str> = exports
        .iter()
        .map(|v| var_name(v))
        .filter(|name| *name != "ALL")
        .collect();

    script.push_str(&format!(
        "# Built by gridplan v{} (slurm)\n",
        context.tool_version
    ));
    script.push_str(&format!("# Command line: {}\n", context.command_line));
    script.push_str(&format!(
        "# Submission time (H:M:S DD/MM/YYYY): {}\n",
        context.submitted_at.format("%H:%M:%S %d/%m/%Y")
    ));
    script.push_str(&format!("# Exported variables: {}\n", exported.join(" ")));
    script.push_str(&format!("# Preserved modules: {}\n", modules.join(" ")));
    script.push('\n');

    match request.payload {
        Payload::Command(ref args) => {
            script.push_str(&shell_join(args));
            script.push('\n');
        }
        Payload::TaskFile { ref path, .. } => {
            script.push_str(&format!(
                "the_command=$(sed -n -e \"${{SLURM_ARRAY_TASK_ID}}p\" {})\n",
                shell_quote(path)
            ));
            script.push('\n');
            script.push_str(&format!("exec {} -c \"$the_command\"\n", options.shell));
        }
    }

    script
}

/// Join arguments into a shell command, quoting those that need it.
fn shell_join(args: &[String]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-quote `arg` unless it is made only of shell-safe characters.
fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_alphanumeric() || "-_./=:,+@%^{}$".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Sanitize a job name for Slurm.
fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .take(64) // Slurm job name limit
        .collect()
}
