//! Operator configuration.
//!
//! The cluster is described in YAML with three top-level sections:
//!
//! ```yaml
//! method_opts:
//!   slurm:
//!     map_ram: true
//!     ram_units: G
//! copro_opts:
//!   cuda:
//!     resource: gpu
//!     classes: true
//!     class_types:
//!       K: { resource: k80, capability: 1 }
//!     default_class: K
//! queues:
//!   short:
//!     time: 60
//!     max_size: 64
//!     slot_size: 4
//!     max_slots: 16
//! ```
//!
//! Queue times are read in [`PlannerOptions::time_units`] and sizes in
//! [`PlannerOptions::ram_units`] unless they carry their own suffix.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use crate::capability::{
    CapabilityModel, CoprocessorClass, CoprocessorType, QueueCoprocessor, QueueDefinition,
    QueueName, SelectionMode, synthesise_compound,
};
use crate::error::{PlanError, PlanResult};
use crate::units::{MemoryUnit, TimeFormat, to_canonical_memory, to_canonical_time};

/// Method options for the Slurm planner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerOptions {
    /// Expand slot counts so that memory fits the queue's slot size.
    pub map_ram: bool,
    /// Unit of queue sizes and bare memory requests.
    pub ram_units: MemoryUnit,
    /// Interpretation of bare queue time limits.
    pub time_units: TimeFormat,
    /// Emit a memory directive when the request asks for it.
    pub notify_ram_usage: bool,
    /// Emit a time directive when the request asks for it.
    pub set_time_limit: bool,
    /// Scheduler supports per-task array dependencies.
    pub array_holds: bool,
    /// Scheduler supports array concurrency limits.
    #[serde(alias = "array_limit")]
    pub array_limits: bool,
    /// Emit mail directives.
    pub mail_support: bool,
    /// Mail mode used when the request names none.
    pub mail_mode: String,
    /// Mail mode letters to scheduler mail types.
    pub mail_modes: BTreeMap<String, Vec<String>>,
    /// Export the submitting environment.
    pub copy_environment: bool,
    /// Reload the submitting shell's modules in the job.
    pub preserve_modules: bool,
    /// Module paths added before loading modules.
    pub add_module_paths: Vec<String>,
    /// Interpreter for the wrapper script.
    pub shell: String,
    /// Prefix of the portable environment aliases.
    pub env_prefix: String,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        let mail_modes = [
            ("b", vec!["BEGIN"]),
            ("e", vec!["END"]),
            ("a", vec!["FAIL", "REQUEUE"]),
            ("f", vec!["ALL"]),
            ("n", vec!["NONE"]),
        ]
        .into_iter()
        .map(|(mode, types)| {
            (
                mode.to_string(),
                types.into_iter().map(String::from).collect(),
            )
        })
        .collect();

        Self {
            map_ram: true,
            ram_units: MemoryUnit::Gigabytes,
            time_units: TimeFormat::Minutes,
            notify_ram_usage: true,
            set_time_limit: true,
            array_holds: true,
            array_limits: true,
            mail_support: false,
            mail_mode: "a".to_string(),
            mail_modes,
            copy_environment: true,
            preserve_modules: true,
            add_module_paths: Vec::new(),
            shell: "/bin/bash".to_string(),
            env_prefix: "GRIDPLAN".to_string(),
        }
    }
}

impl PlannerOptions {
    /// Slurm mail types for a mail mode.
    pub fn mail_types(&self, mode: &str) -> PlanResult<&[String]> {
        self.mail_modes
            .get(mode)
            .map(Vec::as_slice)
            .ok_or_else(|| PlanError::UnknownMailMode(mode.to_string()))
    }
}

/// A scalar that operators may write as a number or as text with a suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Integer(u64),
    Float(f64),
    Text(String),
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Integer(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Text(v) => f.write_str(v),
        }
    }
}

/// A coprocessor class as written in `class_types`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawClass {
    pub resource: String,
    #[serde(default)]
    pub doc: String,
    pub capability: u32,
}

/// A coprocessor type as written in `copro_opts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCoprocessor {
    pub resource: String,
    #[serde(default)]
    pub classes: bool,
    /// `true` selects classes with node constraints, `false` with typed GRES.
    #[serde(default = "default_true")]
    pub class_constraint: bool,
    #[serde(default)]
    pub class_types: BTreeMap<String, RawClass>,
    #[serde(default)]
    pub default_class: Option<String>,
    #[serde(default = "default_true")]
    pub include_more_capable: bool,
    #[serde(default)]
    pub presence_test: Option<String>,
}

/// Coprocessor capacity of a queue as written under `copros`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQueueCoprocessor {
    #[serde(default = "default_one")]
    pub max_quantity: u32,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub exclusive: bool,
}

/// A queue as written under `queues`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQueue {
    pub time: ConfigValue,
    pub max_size: ConfigValue,
    pub max_slots: u32,
    #[serde(default)]
    pub slot_size: Option<ConfigValue>,
    #[serde(default)]
    pub group: u32,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub default: bool,
    #[serde(default)]
    pub copros: BTreeMap<String, RawQueueCoprocessor>,
}

fn default_true() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

/// Parsed operator configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub method_opts: BTreeMap<String, PlannerOptions>,
    #[serde(default)]
    pub copro_opts: BTreeMap<String, RawCoprocessor>,
    /// Queues in declaration order.
    #[serde(default, deserialize_with = "ordered_queues")]
    pub queues: Vec<(String, RawQueue)>,
}

/// Keep queues in the order the operator wrote them.
fn ordered_queues<'de, D>(deserializer: D) -> Result<Vec<(String, RawQueue)>, D::Error>
where
    D: Deserializer<'de>,
{
    let mapping = serde_yaml_ng::Mapping::deserialize(deserializer)?;
    let mut queues = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = match key {
            serde_yaml_ng::Value::String(s) => s,
            other => {
                return Err(serde::de::Error::custom(format!(
                    "queue name must be a string, got {other:?}"
                )));
            }
        };
        let queue: RawQueue = serde_yaml_ng::from_value(value)
            .map_err(|e| serde::de::Error::custom(format!("queue {name}: {e}")))?;
        queues.push((name, queue));
    }
    Ok(queues)
}

impl ClusterConfig {
    /// Method name under `method_opts` used by this planner.
    pub const METHOD: &'static str = "slurm";

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> PlanResult<Self> {
        let config: ClusterConfig = serde_yaml_ng::from_str(yaml)?;
        debug!(
            "Parsed configuration with {} queue(s) and {} coprocessor type(s)",
            config.queues.len(),
            config.copro_opts.len()
        );
        Ok(config)
    }

    /// Planner options, falling back to defaults when the section is absent.
    pub fn options(&self) -> PlannerOptions {
        self.method_opts
            .get(Self::METHOD)
            .cloned()
            .unwrap_or_default()
    }

    /// Build the capability model, synthesising compound queues.
    pub fn build_model(&self) -> PlanResult<CapabilityModel> {
        let options = self.options();

        let coprocessors = self
            .copro_opts
            .iter()
            .map(|(name, raw)| build_coprocessor(name, raw))
            .collect::<PlanResult<Vec<_>>>()?;

        let mut queues = Vec::with_capacity(self.queues.len());
        for (declaration, (name, raw)) in self.queues.iter().enumerate() {
            let mut queue = build_queue(name, raw, &options)?;
            queue.declaration = declaration;
            queues.push(queue);
        }

        let standalone: FxHashMap<String, &QueueDefinition> = queues
            .iter()
            .filter(|q| !q.name.is_compound())
            .map(|q| (q.name.to_string(), q))
            .collect();

        let mut resolved = Vec::with_capacity(queues.len());
        for queue in &queues {
            if !queue.name.is_compound() {
                resolved.push(queue.clone());
                continue;
            }

            let mut members = vec![queue.clone()];
            for constituent in queue.name.constituents() {
                let partition = constituent.split('@').next().unwrap_or(constituent);
                let found = standalone
                    .get(constituent.as_str())
                    .or_else(|| standalone.get(partition));
                if let Some(definition) = found {
                    members.push((*definition).clone());
                }
            }
            resolved.push(synthesise_compound(queue.name.clone(), &members)?);
        }

        CapabilityModel::new(coprocessors, resolved)
    }
}

fn build_coprocessor(name: &str, raw: &RawCoprocessor) -> PlanResult<CoprocessorType> {
    let mut copro = CoprocessorType::new(name, &raw.resource)
        .with_include_more_capable(raw.include_more_capable)
        .with_selection(if raw.class_constraint {
            SelectionMode::Constraint
        } else {
            SelectionMode::Quantity
        });

    if raw.classes {
        let classes = raw.class_types.iter().map(|(selector, class)| {
            CoprocessorClass::new(selector, class.capability, &class.resource)
                .with_doc(class.doc.trim())
        });
        copro = copro.with_classes(classes);
        if let Some(ref default) = raw.default_class {
            copro = copro.with_default_class(default);
        }
    } else if !raw.class_types.is_empty() {
        debug!("Ignoring class_types of {name}: classes are disabled");
    }

    if let Some(ref test) = raw.presence_test {
        copro = copro.with_presence_test(test);
    }

    Ok(copro)
}

fn build_queue(
    name: &str,
    raw: &RawQueue,
    options: &PlannerOptions,
) -> PlanResult<QueueDefinition> {
    let queue_name = QueueName::parse(name)?;

    let time_limit = to_canonical_time(&raw.time.to_string(), options.time_units)?;
    let max_size = to_canonical_memory(&raw.max_size.to_string(), options.ram_units)?;
    let slot_size = raw
        .slot_size
        .as_ref()
        .map(|v| to_canonical_memory(&v.to_string(), options.ram_units))
        .transpose()?;

    let mut queue = QueueDefinition::new(queue_name, time_limit, max_size, raw.max_slots)
        .in_group(raw.group, raw.priority);
    queue.slot_size = slot_size;
    queue.default = raw.default;

    for (copro, entry) in &raw.copros {
        queue = queue.with_coprocessor(
            copro,
            QueueCoprocessor {
                max_quantity: entry.max_quantity,
                classes: entry.classes.clone(),
                exclusive: entry.exclusive,
            },
        );
    }

    Ok(queue)
}
