//! Static model of cluster capacity: coprocessor types and queues.
//!
//! The model is built once from configuration and is read-only afterwards.
//! Compound queues are folded into ordinary [`QueueDefinition`]s at build time,
//! so the matcher never has to special-case them.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{PlanError, PlanResult};

/// Capability rank of a coprocessor class. Higher values are more capable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(pub u32);

impl Capability {
    /// Whether this class is at least as capable as `other`.
    pub fn at_least(self, other: Capability) -> bool {
        self >= other
    }
}

/// One ranked variant of a coprocessor type (e.g. a GPU generation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoprocessorClass {
    /// Identifier used to request this class.
    pub selector: String,
    /// Human-readable description.
    pub doc: String,
    /// Capability rank.
    pub capability: Capability,
    /// Scheduler resource or constraint token for this class.
    pub resource: String,
}

impl CoprocessorClass {
    /// Create a new class.
    pub fn new(
        selector: impl Into<String>,
        capability: u32,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            selector: selector.into(),
            doc: String::new(),
            capability: Capability(capability),
            resource: resource.into(),
        }
    }

    /// Set the description.
    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }
}

/// How the scheduler is told which coprocessor class to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Node feature constraints, which can express alternatives.
    #[default]
    Constraint,
    /// Typed resource quantities, one class per request.
    Quantity,
}

/// A family of coprocessors (e.g. CUDA GPUs).
#[derive(Debug, Clone, Serialize)]
pub struct CoprocessorType {
    /// Type name as requested by users.
    pub name: String,
    /// Generic resource token (the GRES name).
    pub resource: String,
    /// Whether the type is split into ranked classes.
    pub classes_enabled: bool,
    /// Class selection mechanism.
    pub selection: SelectionMode,
    /// Class used when the request names none.
    pub default_class: Option<String>,
    /// Whether more capable classes are accepted by default.
    pub include_more_capable: bool,
    /// Command a collaborator may run to detect local hardware.
    pub presence_test: Option<String>,
    /// Classes sorted by capability.
    classes: Vec<CoprocessorClass>,
}

impl CoprocessorType {
    /// Create an undifferentiated coprocessor type.
    pub fn new(name: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource: resource.into(),
            classes_enabled: false,
            selection: SelectionMode::Constraint,
            default_class: None,
            include_more_capable: true,
            presence_test: None,
            classes: Vec::new(),
        }
    }

    /// Enable classes, keeping them sorted by capability.
    pub fn with_classes(mut self, classes: impl IntoIterator<Item = CoprocessorClass>) -> Self {
        self.classes_enabled = true;
        self.classes = classes.into_iter().collect();
        self.classes
            .sort_by(|a, b| a.capability.cmp(&b.capability).then(a.selector.cmp(&b.selector)));
        self
    }

    /// Set the selection mode.
    pub fn with_selection(mut self, selection: SelectionMode) -> Self {
        self.selection = selection;
        self
    }

    /// Set the default class.
    pub fn with_default_class(mut self, selector: impl Into<String>) -> Self {
        self.default_class = Some(selector.into());
        self
    }

    /// Set whether more capable classes are accepted by default.
    pub fn with_include_more_capable(mut self, include: bool) -> Self {
        self.include_more_capable = include;
        self
    }

    /// Set the presence-test command.
    pub fn with_presence_test(mut self, command: impl Into<String>) -> Self {
        self.presence_test = Some(command.into());
        self
    }

    /// Classes in capability order.
    pub fn classes(&self) -> &[CoprocessorClass] {
        &self.classes
    }

    /// Look up a class by selector.
    pub fn class(&self, selector: &str) -> Option<&CoprocessorClass> {
        self.classes.iter().find(|c| c.selector == selector)
    }

    /// Resolve the requested class, falling back to the default class.
    ///
    /// Returns `None` for types without classes. `"default"` is treated the
    /// same as no class at all.
    pub fn resolve_class(&self, requested: Option<&str>) -> PlanResult<Option<&CoprocessorClass>> {
        if !self.classes_enabled {
            return Ok(None);
        }

        let selector = match requested.filter(|s| !s.eq_ignore_ascii_case("default")) {
            Some(selector) => selector,
            None => self.default_class.as_deref().ok_or_else(|| PlanError::UnknownClass {
                coprocessor: self.name.clone(),
                class: "default".to_string(),
            })?,
        };

        self.class(selector)
            .map(Some)
            .ok_or_else(|| PlanError::UnknownClass {
                coprocessor: self.name.clone(),
                class: selector.to_string(),
            })
    }

    /// Classes acceptable in place of `class`, in capability order.
    ///
    /// Only constraint selection can express alternatives; quantity selection
    /// always yields exactly `class`.
    pub fn qualifying_classes(
        &self,
        class: &CoprocessorClass,
        include_more_capable: bool,
    ) -> Vec<&CoprocessorClass> {
        if include_more_capable && self.selection == SelectionMode::Constraint {
            self.classes
                .iter()
                .filter(|c| c.capability.at_least(class.capability))
                .collect()
        } else {
            self.classes
                .iter()
                .filter(|c| c.selector == class.selector)
                .collect()
        }
    }
}

/// Name of a queue: one partition, or several for a compound queue.
///
/// Constituents may be host-qualified as `partition@host`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueName(Vec<String>);

impl QueueName {
    /// Parse a comma-separated queue name.
    pub fn parse(name: &str) -> PlanResult<Self> {
        let constituents: Vec<String> = name
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if constituents.is_empty() {
            return Err(PlanError::Config(format!("Invalid queue name '{name}'")));
        }
        Ok(Self(constituents))
    }

    /// Constituent names as configured.
    pub fn constituents(&self) -> &[String] {
        &self.0
    }

    /// Whether this name spans more than one partition.
    pub fn is_compound(&self) -> bool {
        self.0.len() > 1
    }

    /// Partition names with any host qualifier removed.
    pub fn partitions(&self) -> Vec<String> {
        let mut partitions: Vec<String> = Vec::with_capacity(self.0.len());
        for constituent in &self.0 {
            let partition = constituent.split('@').next().unwrap_or(constituent);
            if !partitions.iter().any(|p| p == partition) {
                partitions.push(partition.to_string());
            }
        }
        partitions
    }

    /// Hosts named by host-qualified constituents.
    pub fn hosts(&self) -> Vec<String> {
        self.0
            .iter()
            .filter_map(|c| c.split_once('@').map(|(_, host)| host.to_string()))
            .collect()
    }

    /// Whether `name` refers to this queue, either in full or by a partition.
    pub fn matches(&self, name: &str) -> bool {
        self.to_string() == name
            || (!self.is_compound() && self.partitions().first().is_some_and(|p| p == name))
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

/// Coprocessor capacity of one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCoprocessor {
    /// Maximum devices per node.
    pub max_quantity: u32,
    /// Class selectors present on the queue's nodes.
    pub classes: Vec<String>,
    /// Whether devices are allocated exclusively.
    pub exclusive: bool,
}

impl QueueCoprocessor {
    /// Create an entry offering `max_quantity` devices of the given classes.
    pub fn new(max_quantity: u32, classes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            max_quantity,
            classes: classes.into_iter().map(Into::into).collect(),
            exclusive: false,
        }
    }

    /// Whether nodes carry the class `selector`.
    pub fn offers(&self, selector: &str) -> bool {
        self.classes.iter().any(|c| c == selector)
    }
}

/// A queue (Slurm partition) and its resource ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueDefinition {
    /// Queue name.
    pub name: QueueName,
    /// Wall-clock limit in seconds.
    pub time_limit: u64,
    /// Maximum memory per node in megabytes.
    pub max_size: u64,
    /// Maximum slots per node.
    pub max_slots: u32,
    /// Memory per slot in megabytes; `None` disables RAM-to-slot mapping.
    pub slot_size: Option<u64>,
    /// Group of mutually substitutable queues.
    pub group: u32,
    /// Preference within the group; lower wins.
    pub priority: u32,
    /// Whether this is the default queue.
    pub default: bool,
    /// Coprocessor capacity keyed by type name.
    pub coprocessors: BTreeMap<String, QueueCoprocessor>,
    /// Position in the configuration.
    pub declaration: usize,
}

impl QueueDefinition {
    /// Create a queue with the given name and ceilings.
    pub fn new(name: QueueName, time_limit: u64, max_size: u64, max_slots: u32) -> Self {
        Self {
            name,
            time_limit,
            max_size,
            max_slots,
            slot_size: None,
            group: 0,
            priority: 0,
            default: false,
            coprocessors: BTreeMap::new(),
            declaration: 0,
        }
    }

    /// Set the slot size in megabytes.
    pub fn with_slot_size(mut self, megabytes: u64) -> Self {
        self.slot_size = Some(megabytes);
        self
    }

    /// Set group and priority.
    pub fn in_group(mut self, group: u32, priority: u32) -> Self {
        self.group = group;
        self.priority = priority;
        self
    }

    /// Mark as the default queue.
    pub fn as_default(mut self) -> Self {
        self.default = true;
        self
    }

    /// Add coprocessor capacity.
    pub fn with_coprocessor(mut self, name: impl Into<String>, entry: QueueCoprocessor) -> Self {
        self.coprocessors.insert(name.into(), entry);
        self
    }

    /// Coprocessor capacity for a type.
    pub fn coprocessor(&self, name: &str) -> Option<&QueueCoprocessor> {
        self.coprocessors.get(name)
    }
}

/// Fold a compound queue and its constituent definitions into one queue.
///
/// `members[0]` is the compound entry itself and supplies group, priority,
/// default flag and declaration position. Every capacity field is the minimum
/// across members. A slot size is the smallest defined one. Coprocessor types
/// survive only when every member has them, keeping the classes all members
/// share.
pub fn synthesise_compound(
    name: QueueName,
    members: &[QueueDefinition],
) -> PlanResult<QueueDefinition> {
    let Some(first) = members.first() else {
        return Err(PlanError::CompoundQueueInconsistency {
            queue: name.to_string(),
            reason: "no constituent definitions".to_string(),
        });
    };

    let mut queue = QueueDefinition {
        name,
        coprocessors: BTreeMap::new(),
        ..first.clone()
    };

    for member in &members[1..] {
        queue.time_limit = queue.time_limit.min(member.time_limit);
        queue.max_size = queue.max_size.min(member.max_size);
        queue.max_slots = queue.max_slots.min(member.max_slots);
        queue.slot_size = match (queue.slot_size, member.slot_size) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }

    for (copro, entry) in &first.coprocessors {
        let mut merged = entry.clone();
        let mut present_everywhere = true;

        for member in &members[1..] {
            match member.coprocessor(copro) {
                Some(other) => {
                    merged.max_quantity = merged.max_quantity.min(other.max_quantity);
                    merged.classes.retain(|c| other.offers(c));
                    merged.exclusive |= other.exclusive;
                }
                None => {
                    present_everywhere = false;
                    break;
                }
            }
        }

        if !present_everywhere {
            warn!(
                "Dropping {} from compound queue {}: not offered by every constituent",
                copro, queue.name
            );
            continue;
        }

        let any_classes = members.iter().any(|m| {
            m.coprocessor(copro)
                .is_some_and(|entry| !entry.classes.is_empty())
        });
        if any_classes && merged.classes.is_empty() {
            return Err(PlanError::CompoundQueueInconsistency {
                queue: queue.name.to_string(),
                reason: format!("constituents share no {copro} class"),
            });
        }
        if merged.max_quantity == 0 {
            return Err(PlanError::CompoundQueueInconsistency {
                queue: queue.name.to_string(),
                reason: format!("constituents share no {copro} devices"),
            });
        }

        queue.coprocessors.insert(copro.clone(), merged);
    }

    debug!(
        "Synthesised compound queue {} from {} definitions",
        queue.name,
        members.len()
    );
    Ok(queue)
}

/// Coprocessor types and queues of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct CapabilityModel {
    coprocessors: BTreeMap<String, CoprocessorType>,
    queues: Vec<QueueDefinition>,
}

impl CapabilityModel {
    /// Build and validate a model. Queue declaration positions are taken from
    /// the order of `queues`.
    pub fn new(
        coprocessors: impl IntoIterator<Item = CoprocessorType>,
        queues: impl IntoIterator<Item = QueueDefinition>,
    ) -> PlanResult<Self> {
        let mut types = BTreeMap::new();
        for copro in coprocessors {
            validate_coprocessor(&copro)?;
            let name = copro.name.clone();
            if types.insert(name.clone(), copro).is_some() {
                return Err(PlanError::Config(format!(
                    "Coprocessor {name} is defined more than once"
                )));
            }
        }

        let mut seen: FxHashSet<String> = FxHashSet::default();
        let mut defaults = Vec::new();
        let mut ordered = Vec::new();

        for (declaration, mut queue) in queues.into_iter().enumerate() {
            queue.declaration = declaration;
            let name = queue.name.to_string();

            if !seen.insert(name.clone()) {
                return Err(PlanError::Config(format!(
                    "Queue {name} is defined more than once"
                )));
            }
            if queue.max_slots == 0 {
                return Err(PlanError::Config(format!(
                    "Queue {name} must offer at least one slot"
                )));
            }
            if queue.slot_size == Some(0) {
                return Err(PlanError::Config(format!(
                    "Queue {name} has a zero slot size"
                )));
            }

            for (copro, entry) in &queue.coprocessors {
                let ctype = types
                    .get(copro)
                    .ok_or_else(|| PlanError::UnknownCoprocessor(copro.clone()))?;
                for class in &entry.classes {
                    if ctype.class(class).is_none() {
                        return Err(PlanError::UnknownClass {
                            coprocessor: copro.clone(),
                            class: class.clone(),
                        });
                    }
                }
            }

            if queue.default {
                defaults.push(name);
            }
            ordered.push(queue);
        }

        if defaults.len() > 1 {
            return Err(PlanError::Config(format!(
                "More than one default queue: {}",
                defaults.join(", ")
            )));
        }

        debug!(
            "Capability model: {} coprocessor type(s), {} queue(s)",
            types.len(),
            ordered.len()
        );

        Ok(Self {
            coprocessors: types,
            queues: ordered,
        })
    }

    /// All queues in declaration order.
    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    /// Look up a queue by full name or partition.
    pub fn queue(&self, name: &str) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.name.matches(name))
    }

    /// The default queue, if one is configured.
    pub fn default_queue(&self) -> Option<&QueueDefinition> {
        self.queues.iter().find(|q| q.default)
    }

    /// All coprocessor types by name.
    pub fn coprocessors(&self) -> impl Iterator<Item = &CoprocessorType> {
        self.coprocessors.values()
    }

    /// Look up a coprocessor type.
    pub fn coprocessor(&self, name: &str) -> Option<&CoprocessorType> {
        self.coprocessors.get(name)
    }

    /// Queues keyed by group id.
    pub fn groups(&self) -> BTreeMap<u32, Vec<&QueueDefinition>> {
        let mut groups: BTreeMap<u32, Vec<&QueueDefinition>> = BTreeMap::new();
        for queue in &self.queues {
            groups.entry(queue.group).or_default().push(queue);
        }
        groups
    }
}

fn validate_coprocessor(copro: &CoprocessorType) -> PlanResult<()> {
    let mut selectors: FxHashMap<&str, Capability> = FxHashMap::default();
    for class in copro.classes() {
        if selectors.insert(&class.selector, class.capability).is_some() {
            return Err(PlanError::Config(format!(
                "Coprocessor {} defines class {} more than once",
                copro.name, class.selector
            )));
        }
    }

    if copro.classes_enabled {
        if copro.classes().is_empty() {
            return Err(PlanError::Config(format!(
                "Coprocessor {} enables classes but defines none",
                copro.name
            )));
        }
        if let Some(ref default) = copro.default_class {
            if !selectors.contains_key(default.as_str()) {
                return Err(PlanError::UnknownClass {
                    coprocessor: copro.name.clone(),
                    class: default.clone(),
                });
            }
        }
    }

    Ok(())
}
