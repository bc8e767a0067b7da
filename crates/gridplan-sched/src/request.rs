//! Job resource requests.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{PlanError, PlanResult};

/// Whether a memory figure applies to each slot or to the whole job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryScope {
    PerSlot,
    #[default]
    Total,
}

/// Memory requirement in megabytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRequest {
    pub megabytes: u64,
    pub scope: MemoryScope,
}

impl MemoryRequest {
    /// Memory for the whole job.
    pub fn total(megabytes: u64) -> Self {
        Self {
            megabytes,
            scope: MemoryScope::Total,
        }
    }

    /// Memory for each requested slot.
    pub fn per_slot(megabytes: u64) -> Self {
        Self {
            megabytes,
            scope: MemoryScope::PerSlot,
        }
    }
}

/// Accelerator requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoprocessorRequest {
    /// Coprocessor type name.
    pub name: String,
    /// Class selector; `None` or `"default"` selects the type's default class.
    pub class: Option<String>,
    /// Devices per node.
    pub quantity: u32,
    /// Environment module providing the toolkit, e.g. `cuda/12.2`.
    #[serde(default)]
    pub toolkit_module: Option<String>,
}

impl CoprocessorRequest {
    /// Request one device of the type's default class.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class: None,
            quantity: 1,
            toolkit_module: None,
        }
    }

    /// Request a specific class.
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.class = Some(class.into());
        self
    }

    /// Set the number of devices.
    pub fn with_quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    /// Load this toolkit module in the job.
    pub fn with_toolkit_module(mut self, module: impl Into<String>) -> Self {
        self.toolkit_module = Some(module.into());
        self
    }
}

/// Which array indices to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayTasks {
    /// Tasks `1..=n`.
    Count(u32),
    /// Tasks `start..=end` in increments of `step`.
    Range {
        start: u32,
        end: u32,
        step: Option<u32>,
    },
}

impl ArrayTasks {
    /// Check the bounds make sense.
    pub fn validate(&self) -> PlanResult<()> {
        match *self {
            ArrayTasks::Count(0) => Err(PlanError::invalid(
                "array",
                "task count must be at least 1",
            )),
            ArrayTasks::Range { start, end, .. } if end < start => Err(PlanError::invalid(
                "array",
                format!("range end {end} is before start {start}"),
            )),
            ArrayTasks::Range { step: Some(0), .. } => {
                Err(PlanError::invalid("array", "step must be at least 1"))
            }
            _ => Ok(()),
        }
    }
}

impl FromStr for ArrayTasks {
    type Err = PlanError;

    /// Parse `n`, `n-m` or `n-m:s`.
    fn from_str(s: &str) -> PlanResult<Self> {
        let bad = |reason: &str| PlanError::invalid("array", format!("'{s}': {reason}"));
        let number = |text: &str| {
            text.trim()
                .parse::<u32>()
                .map_err(|_| bad("expected a whole number"))
        };

        let (range, step) = match s.split_once(':') {
            Some((range, step)) => (range, Some(number(step)?)),
            None => (s, None),
        };

        let tasks = match range.split_once('-') {
            Some((start, end)) => ArrayTasks::Range {
                start: number(start)?,
                end: number(end)?,
                step,
            },
            None if step.is_none() => ArrayTasks::Count(number(range)?),
            None => return Err(bad("a step needs a start-end range")),
        };
        tasks.validate()?;
        Ok(tasks)
    }
}

impl std::fmt::Display for ArrayTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArrayTasks::Count(n) => write!(f, "1-{n}"),
            ArrayTasks::Range { start, end, step } => {
                write!(f, "{start}-{end}")?;
                if let Some(step) = step {
                    write!(f, ":{step}")?;
                }
                Ok(())
            }
        }
    }
}

/// Array job structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArraySpec {
    pub tasks: ArrayTasks,
    /// Maximum tasks running at once.
    pub limit: Option<u32>,
    /// Parent arrays whose matching task must finish first.
    pub hold: Vec<String>,
}

impl ArraySpec {
    /// Array over the given tasks.
    pub fn new(tasks: ArrayTasks) -> Self {
        Self {
            tasks,
            limit: None,
            hold: Vec::new(),
        }
    }

    /// Limit concurrently running tasks.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Hold each task on the same index of `parent`.
    pub fn with_hold(mut self, parent: impl Into<String>) -> Self {
        self.hold.push(parent.into());
        self
    }
}

/// What the job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// A single command line.
    Command(Vec<String>),
    /// A file with one command per line, one line per array task.
    TaskFile { path: String, tasks: u32 },
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Command(Vec::new())
    }
}

/// A job to be planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobRequest {
    pub name: String,
    pub slots: u32,
    pub memory: Option<MemoryRequest>,
    /// Wall-clock time in seconds.
    pub time: Option<u64>,
    pub coprocessor: Option<CoprocessorRequest>,
    pub array: Option<ArraySpec>,
    /// Jobs that must complete before this one starts.
    pub holds: Vec<String>,
    pub mail_to: Option<String>,
    pub mail_mode: Option<String>,
    /// `NAME` or `NAME=value` entries to export.
    pub export_vars: Vec<String>,
    pub project: Option<String>,
    pub notify_memory: bool,
    pub notify_time: bool,
    pub include_more_capable: bool,
    /// Submit to this queue instead of choosing one.
    pub queue: Option<String>,
    /// Only consider queues in this group.
    pub group: Option<u32>,
    /// Extra generic resources, appended to the coprocessor request.
    pub resources: Vec<String>,
    pub log_dir: Option<String>,
    pub work_dir: Option<String>,
    pub requeueable: bool,
    /// Run the slots as tasks on one node rather than threads of one task.
    pub parallel_env: bool,
    pub payload: Payload,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            name: "gridplan_job".to_string(),
            slots: 1,
            memory: None,
            time: None,
            coprocessor: None,
            array: None,
            holds: Vec::new(),
            mail_to: None,
            mail_mode: None,
            export_vars: Vec::new(),
            project: None,
            notify_memory: true,
            notify_time: true,
            include_more_capable: true,
            queue: None,
            group: None,
            resources: Vec::new(),
            log_dir: None,
            work_dir: None,
            requeueable: true,
            parallel_env: false,
            payload: Payload::default(),
        }
    }
}

impl JobRequest {
    /// Create a single-slot request running `command`.
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            payload: Payload::Command(command.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Create an array request running one line of `path` per task.
    pub fn from_task_file(path: impl Into<String>, lines: u32) -> Self {
        Self {
            payload: Payload::TaskFile {
                path: path.into(),
                tasks: lines,
            },
            array: Some(ArraySpec::new(ArrayTasks::Count(lines))),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_slots(mut self, slots: u32) -> Self {
        self.slots = slots;
        self
    }

    pub fn with_memory(mut self, memory: MemoryRequest) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Set the wall-clock time in seconds.
    pub fn with_time(mut self, seconds: u64) -> Self {
        self.time = Some(seconds);
        self
    }

    pub fn with_coprocessor(mut self, coprocessor: CoprocessorRequest) -> Self {
        self.coprocessor = Some(coprocessor);
        self
    }

    /// Make this an array job. A task file keeps its own task count.
    pub fn with_array(mut self, array: ArraySpec) -> Self {
        let tasks = match self.payload {
            Payload::TaskFile { tasks, .. } => ArrayTasks::Count(tasks),
            Payload::Command(_) => array.tasks,
        };
        self.array = Some(ArraySpec { tasks, ..array });
        self
    }

    pub fn with_hold(mut self, job_id: impl Into<String>) -> Self {
        self.holds.push(job_id.into());
        self
    }

    /// Send mail to `address`, optionally with a specific mail mode.
    pub fn with_mail(mut self, address: impl Into<String>, mode: Option<&str>) -> Self {
        self.mail_to = Some(address.into());
        self.mail_mode = mode.map(String::from);
        self
    }

    pub fn with_export(mut self, var: impl Into<String>) -> Self {
        self.export_vars.push(var.into());
        self
    }

    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_group(mut self, group: u32) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<String>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn with_notify_memory(mut self, notify: bool) -> Self {
        self.notify_memory = notify;
        self
    }

    pub fn with_notify_time(mut self, notify: bool) -> Self {
        self.notify_time = notify;
        self
    }

    pub fn with_include_more_capable(mut self, include: bool) -> Self {
        self.include_more_capable = include;
        self
    }

    pub fn with_requeueable(mut self, requeueable: bool) -> Self {
        self.requeueable = requeueable;
        self
    }

    pub fn with_parallel_env(mut self, parallel_env: bool) -> Self {
        self.parallel_env = parallel_env;
        self
    }

    /// Total memory for the job in megabytes.
    pub fn total_memory(&self) -> u64 {
        match self.memory {
            Some(MemoryRequest {
                megabytes,
                scope: MemoryScope::PerSlot,
            }) => megabytes.saturating_mul(u64::from(self.slots)),
            Some(MemoryRequest { megabytes, .. }) => megabytes,
            None => 0,
        }
    }

    /// Whether the job is an array job.
    pub fn is_array(&self) -> bool {
        self.array.is_some()
    }

    /// Check the request is well formed.
    pub fn validate(&self) -> PlanResult<()> {
        if self.name.trim().is_empty() {
            return Err(PlanError::invalid("name", "must not be empty"));
        }
        if self.slots == 0 {
            return Err(PlanError::invalid("slots", "must be at least 1"));
        }
        if let Some(ref copro) = self.coprocessor {
            if copro.quantity == 0 {
                return Err(PlanError::invalid(
                    "coprocessor_multi",
                    "must request at least one device",
                ));
            }
        }
        if let Some(ref array) = self.array {
            array.tasks.validate()?;
            if array.limit == Some(0) {
                return Err(PlanError::invalid("array_limit", "must be at least 1"));
            }
        }
        match self.payload {
            Payload::Command(ref args) if args.is_empty() => {
                Err(PlanError::invalid("command", "no command given"))
            }
            Payload::TaskFile { tasks: 0, ref path } => Err(PlanError::invalid(
                "command",
                format!("task file {path} is empty"),
            )),
            Payload::TaskFile { .. } if self.array.is_none() => Err(PlanError::invalid(
                "array",
                "task files run as array jobs",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_array_tasks() {
        assert_eq!("10".parse::<ArrayTasks>().unwrap(), ArrayTasks::Count(10));
        assert_eq!(
            "2-8".parse::<ArrayTasks>().unwrap(),
            ArrayTasks::Range {
                start: 2,
                end: 8,
                step: None
            }
        );
        assert_eq!(
            "1-100:10".parse::<ArrayTasks>().unwrap(),
            ArrayTasks::Range {
                start: 1,
                end: 100,
                step: Some(10)
            }
        );
        assert!("0".parse::<ArrayTasks>().is_err());
        assert!("8-2".parse::<ArrayTasks>().is_err());
        assert!("1-4:0".parse::<ArrayTasks>().is_err());
        assert!("4:2".parse::<ArrayTasks>().is_err());
        assert!("a-b".parse::<ArrayTasks>().is_err());
    }

    #[test]
    fn test_array_tasks_display() {
        assert_eq!(ArrayTasks::Count(5).to_string(), "1-5");
        assert_eq!("3-9:3".parse::<ArrayTasks>().unwrap().to_string(), "3-9:3");
        assert_eq!("3-9".parse::<ArrayTasks>().unwrap().to_string(), "3-9");
    }

    #[test]
    fn test_total_memory() {
        let job = JobRequest::new(["true"])
            .with_slots(4)
            .with_memory(MemoryRequest::per_slot(2048));
        assert_eq!(job.total_memory(), 8192);

        let job = job.with_memory(MemoryRequest::total(2048));
        assert_eq!(job.total_memory(), 2048);

        assert_eq!(JobRequest::new(["true"]).total_memory(), 0);
    }

    #[test]
    fn test_task_file_keeps_line_count() {
        let job = JobRequest::from_task_file("tasks.txt", 12)
            .with_array(ArraySpec::new(ArrayTasks::Count(3)).with_limit(4));
        let array = job.array.as_ref().unwrap();
        assert_eq!(array.tasks, ArrayTasks::Count(12));
        assert_eq!(array.limit, Some(4));
        assert!(job.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        assert!(JobRequest::new(["echo", "hi"]).validate().is_ok());

        let err = JobRequest::new(["true"]).with_slots(0).validate().unwrap_err();
        assert_eq!(err.field(), Some("slots"));

        let err = JobRequest::new(Vec::<String>::new()).validate().unwrap_err();
        assert_eq!(err.field(), Some("command"));

        let err = JobRequest::new(["true"])
            .with_coprocessor(CoprocessorRequest::new("cuda").with_quantity(0))
            .validate()
            .unwrap_err();
        assert_eq!(err.field(), Some("coprocessor_multi"));

        let err = JobRequest::from_task_file("empty.txt", 0).validate().unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }

    #[test]
    fn test_defaults() {
        let job = JobRequest::new(["true"]);
        assert_eq!(job.slots, 1);
        assert!(job.notify_memory);
        assert!(job.notify_time);
        assert!(job.include_more_capable);
        assert!(job.requeueable);
        assert!(!job.parallel_env);
        assert!(!job.is_array());
    }

    #[test]
    fn test_deserialize_request() {
        let job: JobRequest = serde_json::from_str(
            r#"{"name": "feat", "slots": 2, "memory": {"megabytes": 1024, "scope": "per_slot"},
                "payload": {"command": ["feat", "design.fsf"]}}"#,
        )
        .unwrap();
        assert_eq!(job.total_memory(), 2048);
        assert!(job.requeueable);
    }
}
