//! Queue selection.
//!
//! Every candidate queue is evaluated against the request in a fixed order
//! (coprocessor, memory, slots, time). Survivors are ranked by priority, then
//! by the slot count they would need, then by declaration order. When nothing
//! survives, the error names the dimension that got closest to being met.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::debug;

use crate::capability::{CapabilityModel, QueueDefinition};
use crate::config::PlannerOptions;
use crate::error::{PlanError, PlanResult, UnmetDimension};
use crate::request::JobRequest;
use crate::units::split_across_slots;

/// The queue chosen for a request.
#[derive(Debug, Clone, Serialize)]
pub struct QueueMatch<'m> {
    /// Best queue.
    pub queue: &'m QueueDefinition,
    /// Slots to request on that queue, after RAM-to-slot expansion.
    pub slots: u32,
    /// Other qualifying queues of the same group, best first.
    pub alternatives: Vec<&'m QueueDefinition>,
}

/// Coprocessor requirement with the request's class already resolved.
struct WantedCoprocessor<'a> {
    name: &'a str,
    quantity: u32,
    /// Acceptable class selectors; empty for types without classes.
    classes: Vec<&'a str>,
}

struct Rejection {
    dimension: UnmetDimension,
    detail: String,
}

impl Rejection {
    fn new(dimension: UnmetDimension, detail: String) -> Self {
        Self { dimension, detail }
    }
}

#[derive(Clone, Copy)]
struct Candidate<'m> {
    queue: &'m QueueDefinition,
    slots: u32,
}

/// Choose the best queue for `request`.
pub fn select_queue<'m>(
    request: &JobRequest,
    model: &'m CapabilityModel,
    options: &PlannerOptions,
) -> PlanResult<QueueMatch<'m>> {
    request.validate()?;

    let wanted = match request.coprocessor {
        Some(ref copro) => {
            let ctype = model
                .coprocessor(&copro.name)
                .ok_or_else(|| PlanError::UnknownCoprocessor(copro.name.clone()))?;
            let include = request.include_more_capable && ctype.include_more_capable;
            let classes = match ctype.resolve_class(copro.class.as_deref())? {
                Some(class) => ctype
                    .qualifying_classes(class, include)
                    .into_iter()
                    .map(|c| c.selector.as_str())
                    .collect(),
                None => Vec::new(),
            };
            Some(WantedCoprocessor {
                name: &copro.name,
                quantity: copro.quantity,
                classes,
            })
        }
        None => None,
    };

    let candidates = candidate_queues(request, model)?;
    let total_memory = request.total_memory();

    let mut survivors = Vec::new();
    let mut furthest: Option<Rejection> = None;

    for queue in candidates {
        match evaluate(queue, request, wanted.as_ref(), total_memory, options) {
            Ok(slots) => {
                debug!("Queue {} qualifies with {} slot(s)", queue.name, slots);
                survivors.push(Candidate { queue, slots });
            }
            Err(rejection) => {
                debug!(
                    "Queue {} rejected on {}: {}",
                    queue.name, rejection.dimension, rejection.detail
                );
                if furthest
                    .as_ref()
                    .is_none_or(|f| rejection.dimension > f.dimension)
                {
                    furthest = Some(rejection);
                }
            }
        }
    }

    if survivors.is_empty() {
        return Err(match furthest {
            Some(rejection) => PlanError::NoMatchingQueue {
                dimension: rejection.dimension,
                detail: rejection.detail,
            },
            None => PlanError::Config("No queues configured".to_string()),
        });
    }

    let group = choose_group(&survivors, model);
    let mut ranked: Vec<Candidate<'m>> = survivors
        .into_iter()
        .filter(|c| c.queue.group == group)
        .collect();
    ranked.sort_by_key(|c| (c.queue.priority, c.slots, c.queue.declaration));

    let Some((best, rest)) = ranked.split_first() else {
        return Err(PlanError::Config(format!("Group {group} has no queues")));
    };

    debug!(
        "Selected queue {} from group {} ({} alternative(s))",
        best.queue.name,
        group,
        rest.len()
    );

    Ok(QueueMatch {
        queue: best.queue,
        slots: best.slots,
        alternatives: rest.iter().map(|c| c.queue).collect(),
    })
}

/// Queues the request may use, honouring an explicit queue or group.
fn candidate_queues<'m>(
    request: &JobRequest,
    model: &'m CapabilityModel,
) -> PlanResult<Vec<&'m QueueDefinition>> {
    if let Some(ref name) = request.queue {
        let queue = model
            .queue(name)
            .ok_or_else(|| PlanError::invalid("queue", format!("unknown queue {name}")))?;
        return Ok(vec![queue]);
    }

    if let Some(group) = request.group {
        let queues: Vec<&QueueDefinition> =
            model.queues().iter().filter(|q| q.group == group).collect();
        if queues.is_empty() {
            return Err(PlanError::invalid(
                "group",
                format!("no queues in group {group}"),
            ));
        }
        return Ok(queues);
    }

    Ok(model.queues().iter().collect())
}

/// Check one queue, returning the slot count it would need.
fn evaluate(
    queue: &QueueDefinition,
    request: &JobRequest,
    wanted: Option<&WantedCoprocessor<'_>>,
    total_memory: u64,
    options: &PlannerOptions,
) -> Result<u32, Rejection> {
    if let Some(wanted) = wanted {
        let Some(entry) = queue.coprocessor(wanted.name) else {
            return Err(Rejection::new(
                UnmetDimension::Coprocessor,
                format!("no queue offers {}", wanted.name),
            ));
        };
        if entry.max_quantity < wanted.quantity {
            return Err(Rejection::new(
                UnmetDimension::Coprocessor,
                format!(
                    "{} x {} requested, at most {} per node",
                    wanted.quantity, wanted.name, entry.max_quantity
                ),
            ));
        }
        if !wanted.classes.is_empty() && !wanted.classes.iter().any(|c| entry.offers(c)) {
            return Err(Rejection::new(
                UnmetDimension::Coprocessor,
                format!(
                    "no queue offers {} class {}",
                    wanted.name,
                    wanted.classes.join("|")
                ),
            ));
        }
    }

    if total_memory > queue.max_size {
        return Err(Rejection::new(
            UnmetDimension::Memory,
            format!(
                "{}MB requested, at most {}MB per node",
                total_memory, queue.max_size
            ),
        ));
    }

    let mut slots = request.slots;
    let mut expanded = false;
    if options.map_ram {
        if let Some(slot_size) = queue.slot_size {
            let needed = u32::try_from(total_memory.div_ceil(slot_size)).unwrap_or(u32::MAX);
            if needed > slots {
                slots = needed;
                expanded = true;
            }
        }
    }

    if slots > queue.max_slots {
        return Err(if expanded {
            Rejection::new(
                UnmetDimension::Memory,
                format!(
                    "{}MB needs {} slots, at most {} per node",
                    total_memory, slots, queue.max_slots
                ),
            )
        } else {
            Rejection::new(
                UnmetDimension::Slots,
                format!("{} slots requested, at most {} per node", slots, queue.max_slots),
            )
        });
    }

    // Per-slot memory rounds up, so the rounded total must still fit the node.
    if total_memory > 0 {
        let fitting = (slots..=queue.max_slots).find(|&candidate| {
            split_across_slots(total_memory, candidate).saturating_mul(u64::from(candidate))
                <= queue.max_size
        });
        match fitting {
            Some(fitting) => slots = fitting,
            None => {
                return Err(Rejection::new(
                    UnmetDimension::Memory,
                    format!(
                        "{}MB cannot be split over {} to {} slots within {}MB",
                        total_memory, slots, queue.max_slots, queue.max_size
                    ),
                ));
            }
        }
    }

    if let Some(time) = request.time {
        if time > queue.time_limit {
            return Err(Rejection::new(
                UnmetDimension::Time,
                format!("{}s requested, at most {}s", time, queue.time_limit),
            ));
        }
    }

    Ok(slots)
}

/// Pick the group to submit to when several qualify.
///
/// The default queue's group wins when it qualifies. Otherwise the best
/// candidate overall decides, ties going to the lowest group id.
fn choose_group(survivors: &[Candidate<'_>], model: &CapabilityModel) -> u32 {
    let groups: BTreeSet<u32> = survivors.iter().map(|c| c.queue.group).collect();

    if groups.len() == 1 {
        if let Some(&group) = groups.first() {
            return group;
        }
    }

    if let Some(default) = model.default_queue() {
        if groups.contains(&default.group) {
            return default.group;
        }
    }

    survivors
        .iter()
        .min_by_key(|c| (c.queue.priority, c.slots, c.queue.group, c.queue.declaration))
        .map_or(0, |c| c.queue.group)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{
        CoprocessorClass, CoprocessorType, QueueCoprocessor, QueueName,
    };
    use crate::request::{CoprocessorRequest, MemoryRequest};

    const GB: u64 = 1024;

    fn queue(name: &str, time: u64, max_size_gb: u64, max_slots: u32) -> QueueDefinition {
        QueueDefinition::new(QueueName::parse(name).unwrap(), time, max_size_gb * GB, max_slots)
    }

    fn cuda() -> CoprocessorType {
        CoprocessorType::new("cuda", "gpu")
            .with_classes([
                CoprocessorClass::new("K", 1, "k80"),
                CoprocessorClass::new("P", 2, "p100"),
                CoprocessorClass::new("V", 3, "v100"),
            ])
            .with_default_class("K")
    }

    fn job() -> JobRequest {
        JobRequest::new(["./run.sh"])
    }

    #[test]
    fn test_slot_expansion() {
        let model = CapabilityModel::new(
            [],
            [queue("short", 3600, 64, 16).with_slot_size(4 * GB)],
        )
        .unwrap();
        let request = job()
            .with_memory(MemoryRequest::total(20 * GB))
            .with_time(1800);

        let matched = select_queue(&request, &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.queue.name.to_string(), "short");
        assert_eq!(matched.slots, 5);
    }

    #[test]
    fn test_no_expansion_without_map_ram() {
        let model = CapabilityModel::new(
            [],
            [queue("short", 3600, 64, 16).with_slot_size(4 * GB)],
        )
        .unwrap();
        let request = job().with_memory(MemoryRequest::total(20 * GB));
        let options = PlannerOptions {
            map_ram: false,
            ..Default::default()
        };

        let matched = select_queue(&request, &model, &options).unwrap();
        assert_eq!(matched.slots, 1);
    }

    #[test]
    fn test_memory_dimension_reported() {
        let model = CapabilityModel::new(
            [],
            [queue("short", 3600, 64, 16), queue("long", 86400, 96, 32)],
        )
        .unwrap();
        let request = job().with_memory(MemoryRequest::total(100 * GB));

        let err = select_queue(&request, &model, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Memory));
    }

    #[test]
    fn test_slot_expansion_overflow_is_memory() {
        let model = CapabilityModel::new(
            [],
            [queue("small", 3600, 64, 4).with_slot_size(4 * GB)],
        )
        .unwrap();
        let request = job().with_memory(MemoryRequest::total(32 * GB));

        let err = select_queue(&request, &model, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Memory));

        let request = job().with_slots(8);
        let err = select_queue(&request, &model, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Slots));
    }

    #[test]
    fn test_rounded_memory_stays_within_node() {
        let model = CapabilityModel::new([], [queue("short", 3600, 64, 16)]).unwrap();
        let request = job()
            .with_slots(3)
            .with_memory(MemoryRequest::total(64 * GB));

        let matched = select_queue(&request, &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.slots, 4);
        let per_slot = split_across_slots(64 * GB, matched.slots);
        assert!(per_slot * u64::from(matched.slots) <= 64 * GB);

        let narrow = CapabilityModel::new([], [queue("narrow", 3600, 64, 3)]).unwrap();
        let err = select_queue(&request, &narrow, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Memory));
    }

    #[test]
    fn test_furthest_dimension_wins() {
        let model = CapabilityModel::new(
            [],
            [queue("tiny", 86400, 1, 16), queue("quick", 600, 64, 16)],
        )
        .unwrap();
        let request = job()
            .with_memory(MemoryRequest::total(8 * GB))
            .with_time(3600);

        let err = select_queue(&request, &model, &PlannerOptions::default()).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Time));
    }

    #[test]
    fn test_priority_within_group() {
        let model = CapabilityModel::new(
            [],
            [
                queue("second", 3600, 64, 16).in_group(1, 2),
                queue("first", 3600, 64, 16).in_group(1, 1),
            ],
        )
        .unwrap();

        let matched = select_queue(&job(), &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.queue.name.to_string(), "first");
        assert_eq!(matched.alternatives.len(), 1);
        assert_eq!(matched.alternatives[0].name.to_string(), "second");
    }

    #[test]
    fn test_fewer_slots_preferred() {
        let model = CapabilityModel::new(
            [],
            [
                queue("thin", 3600, 64, 16).with_slot_size(2 * GB),
                queue("fat", 3600, 64, 16).with_slot_size(8 * GB),
            ],
        )
        .unwrap();
        let request = job().with_memory(MemoryRequest::total(16 * GB));

        let matched = select_queue(&request, &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.queue.name.to_string(), "fat");
        assert_eq!(matched.slots, 2);
    }

    #[test]
    fn test_default_group_wins() {
        let model = CapabilityModel::new(
            [],
            [
                queue("other", 3600, 64, 16).in_group(1, 1),
                queue("main", 3600, 64, 16).in_group(2, 5).as_default(),
            ],
        )
        .unwrap();

        let matched = select_queue(&job(), &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.queue.name.to_string(), "main");
        assert!(matched.alternatives.is_empty());
    }

    #[test]
    fn test_lowest_group_breaks_ties() {
        let model = CapabilityModel::new(
            [],
            [
                queue("b", 3600, 64, 16).in_group(2, 1),
                queue("a", 3600, 64, 16).in_group(1, 1),
            ],
        )
        .unwrap();

        let matched = select_queue(&job(), &model, &PlannerOptions::default()).unwrap();
        assert_eq!(matched.queue.name.to_string(), "a");
    }

    #[test]
    fn test_explicit_queue_and_group() {
        let model = CapabilityModel::new(
            [],
            [
                queue("a", 3600, 64, 16).in_group(1, 1),
                queue("b", 3600, 64, 16).in_group(2, 1),
            ],
        )
        .unwrap();
        let options = PlannerOptions::default();

        let matched = select_queue(&job().with_queue("b"), &model, &options).unwrap();
        assert_eq!(matched.queue.name.to_string(), "b");

        let matched = select_queue(&job().with_group(2), &model, &options).unwrap();
        assert_eq!(matched.queue.name.to_string(), "b");

        let err = select_queue(&job().with_queue("zzz"), &model, &options).unwrap_err();
        assert_eq!(err.field(), Some("queue"));

        let err = select_queue(&job().with_group(9), &model, &options).unwrap_err();
        assert_eq!(err.field(), Some("group"));
    }

    #[test]
    fn test_coprocessor_filter() {
        let model = CapabilityModel::new(
            [cuda()],
            [
                queue("cpu", 3600, 64, 16).in_group(1, 1),
                queue("kepler", 3600, 64, 16)
                    .in_group(2, 1)
                    .with_coprocessor("cuda", QueueCoprocessor::new(4, ["K"])),
                queue("volta", 3600, 64, 16)
                    .in_group(2, 2)
                    .with_coprocessor("cuda", QueueCoprocessor::new(2, ["V"])),
            ],
        )
        .unwrap();
        let options = PlannerOptions::default();

        let request = job().with_coprocessor(CoprocessorRequest::new("cuda").with_class("P"));
        let matched = select_queue(&request, &model, &options).unwrap();
        assert_eq!(matched.queue.name.to_string(), "volta");

        let strict = request.clone().with_include_more_capable(false);
        let err = select_queue(&strict, &model, &options).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Coprocessor));

        let many = job().with_coprocessor(CoprocessorRequest::new("cuda").with_quantity(4));
        let matched = select_queue(&many, &model, &options).unwrap();
        assert_eq!(matched.queue.name.to_string(), "kepler");

        let too_many = job().with_coprocessor(CoprocessorRequest::new("cuda").with_quantity(8));
        let err = select_queue(&too_many, &model, &options).unwrap_err();
        assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Coprocessor));
    }

    #[test]
    fn test_unknown_coprocessor() {
        let model = CapabilityModel::new([cuda()], [queue("a", 3600, 64, 16)]).unwrap();
        let options = PlannerOptions::default();

        let err = select_queue(
            &job().with_coprocessor(CoprocessorRequest::new("tpu")),
            &model,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownCoprocessor(_)));

        let err = select_queue(
            &job().with_coprocessor(CoprocessorRequest::new("cuda").with_class("A")),
            &model,
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnknownClass { .. }));
    }
}
