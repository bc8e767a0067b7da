//! Property-based tests for queue matching and unit conversion.

use gridplan_sched::capability::synthesise_compound;
use gridplan_sched::units::{
    format_slurm_time, from_megabytes, split_across_slots, to_canonical_memory,
    to_canonical_time,
};
use gridplan_sched::{
    CapabilityModel, CoprocessorType, JobRequest, MemoryRequest, MemoryUnit, PlannerOptions,
    QueueDefinition, QueueName, TimeFormat, select_queue,
};
use proptest::prelude::*;

const GB: u64 = 1024;

/// Queue limits: (time s, max size GB, max slots, slot size GB, group, priority).
type QueueSpec = (u64, u64, u32, Option<u64>, u32, u32);

fn arb_queue_spec() -> impl Strategy<Value = QueueSpec> {
    (
        60_u64..=172_800,
        1_u64..=256,
        1_u32..=64,
        prop::option::of(1_u64..=16),
        0_u32..3,
        0_u32..3,
    )
}

/// Requests: (slots, total memory MB, time s).
fn arb_request() -> impl Strategy<Value = (u32, u64, u64)> {
    (1_u32..=32, 0_u64..=300 * GB, 1_u64..=200_000)
}

fn build_queue(index: usize, spec: QueueSpec) -> QueueDefinition {
    let (time, max_size, max_slots, slot_size, group, priority) = spec;
    let name = QueueName::parse(&format!("q{index}")).unwrap();
    let mut queue = QueueDefinition::new(name, time, max_size * GB, max_slots)
        .in_group(group, priority);
    queue.slot_size = slot_size.map(|s| s * GB);
    queue
}

fn build_model(specs: &[QueueSpec]) -> CapabilityModel {
    let queues = specs
        .iter()
        .enumerate()
        .map(|(i, spec)| build_queue(i, *spec));
    CapabilityModel::new(Vec::<CoprocessorType>::new(), queues).unwrap()
}

/// Whether a queue can take the request, computed independently of the matcher.
fn fits(queue: &QueueDefinition, slots: u32, memory: u64, time: u64) -> bool {
    let needed = match queue.slot_size {
        Some(size) => u64::from(slots).max(memory.div_ceil(size)),
        None => u64::from(slots),
    };
    let max_slots = u64::from(queue.max_slots);
    let splits = memory == 0
        || (needed..=max_slots).any(|s| memory.div_ceil(s) * s <= queue.max_size);
    memory <= queue.max_size && needed <= max_slots && splits && time <= queue.time_limit
}

proptest! {
    /// A chosen queue never exceeds its own limits.
    #[test]
    fn test_selection_is_sound(
        specs in prop::collection::vec(arb_queue_spec(), 1..=6),
        (slots, memory, time) in arb_request(),
    ) {
        let model = build_model(&specs);
        let request = JobRequest::new(["true"])
            .with_slots(slots)
            .with_memory(MemoryRequest::total(memory))
            .with_time(time);

        if let Ok(matched) = select_queue(&request, &model, &PlannerOptions::default()) {
            prop_assert!(matched.slots >= slots);
            prop_assert!(matched.slots <= matched.queue.max_slots);
            prop_assert!(time <= matched.queue.time_limit);
            prop_assert!(memory <= matched.queue.max_size);
            let per_slot = split_across_slots(memory, matched.slots);
            prop_assert!(per_slot * u64::from(matched.slots) <= matched.queue.max_size);
            for alternative in &matched.alternatives {
                prop_assert_eq!(alternative.group, matched.queue.group);
            }
        }
    }

    /// A request is rejected only when no queue could take it.
    #[test]
    fn test_selection_is_complete(
        specs in prop::collection::vec(arb_queue_spec(), 1..=6),
        (slots, memory, time) in arb_request(),
    ) {
        let model = build_model(&specs);
        let request = JobRequest::new(["true"])
            .with_slots(slots)
            .with_memory(MemoryRequest::total(memory))
            .with_time(time);

        let any_fits = model.queues().iter().any(|q| fits(q, slots, memory, time));
        let result = select_queue(&request, &model, &PlannerOptions::default());
        prop_assert_eq!(result.is_ok(), any_fits);
    }

    /// Compound queues take the minimum of every constituent bound.
    #[test]
    fn test_compound_is_minimum(
        specs in prop::collection::vec(arb_queue_spec(), 2..=4),
    ) {
        let members: Vec<QueueDefinition> = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| build_queue(i, *spec))
            .collect();
        let name = QueueName::parse("q0,q1").unwrap();
        let compound = synthesise_compound(name, &members).unwrap();

        prop_assert_eq!(compound.time_limit, members.iter().map(|q| q.time_limit).min().unwrap());
        prop_assert_eq!(compound.max_size, members.iter().map(|q| q.max_size).min().unwrap());
        prop_assert_eq!(compound.max_slots, members.iter().map(|q| q.max_slots).min().unwrap());
        prop_assert_eq!(compound.slot_size, members.iter().filter_map(|q| q.slot_size).min());
        prop_assert_eq!(compound.group, members[0].group);
    }

    /// Canonical values convert to themselves.
    #[test]
    fn test_canonical_values_are_fixed_points(
        megabytes in 0_u64..=u64::MAX / 2,
        seconds in 0_u64..=10_000_000,
    ) {
        prop_assert_eq!(
            to_canonical_memory(&megabytes.to_string(), MemoryUnit::Megabytes).unwrap(),
            megabytes
        );
        prop_assert_eq!(
            to_canonical_time(&seconds.to_string(), TimeFormat::Seconds).unwrap(),
            seconds
        );
    }

    /// Whole values survive a trip through megabytes and back.
    #[test]
    fn test_memory_round_trip_within_unit(value in 0_u64..=1_000_000) {
        for unit in [MemoryUnit::Megabytes, MemoryUnit::Gigabytes, MemoryUnit::Terabytes] {
            let megabytes = to_canonical_memory(&value.to_string(), unit).unwrap();
            prop_assert_eq!(from_megabytes(megabytes, unit), value);
        }
    }

    /// Slurm time strings parse back to the same number of seconds.
    #[test]
    fn test_slurm_time_round_trip(seconds in 0_u64..=100 * 86_400) {
        let formatted = format_slurm_time(seconds);
        prop_assert_eq!(to_canonical_time(&formatted, TimeFormat::Minutes).unwrap(), seconds);
    }
}
