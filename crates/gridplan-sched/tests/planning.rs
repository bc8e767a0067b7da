//! End-to-end planning against realistic cluster configurations.

use chrono::NaiveDate;
use gridplan_sched::{
    ArraySpec, ArrayTasks, CoprocessorRequest, CoprocessorToken, JobRequest, MemoryRequest,
    PlanError, PlanWarning, Planner, SubmissionContext, UnmetDimension,
};

const GB: u64 = 1024;

/// A small departmental cluster: two CPU queues, a GPU queue and a big-memory host.
const CLUSTER: &str = r#"
method_opts:
  slurm:
    mail_support: true
    array_holds: false
    add_module_paths:
      - /usr/local/shellmodules
copro_opts:
  cuda:
    resource: gpu
    classes: true
    class_types:
      K:
        resource: k80
        doc: Kepler. ECC, double- or single-precision workloads
        capability: 1
      P:
        resource: p100
        doc: >
          Pascal. ECC, double-, single- and half-precision
          workloads
        capability: 2
      V:
        resource: v100
        doc: Volta
        capability: 3
    default_class: K
queues:
  short:
    time: 60
    max_size: 64
    slot_size: 4
    max_slots: 16
    group: 1
    priority: 1
    default: true
  long:
    time: 2880
    max_size: 64
    slot_size: 4
    max_slots: 16
    group: 1
    priority: 2
  gpu:
    time: 4320
    max_size: 96
    max_slots: 32
    group: 2
    copros:
      cuda:
        max_quantity: 4
        classes: [K, P, V]
  bigmem@node7:
    time: 1440
    max_size: 96
    max_slots: 8
    group: 3
"#;

/// Typed GPU selection with a compound queue spanning two node types.
const GPU_CLUSTER: &str = r#"
copro_opts:
  cuda:
    resource: gpu
    classes: true
    class_constraint: false
    class_types:
      A: { resource: a100, capability: 1 }
      H: { resource: h100, capability: 2 }
    default_class: A
queues:
  ampere:
    time: 1440
    max_size: 256
    max_slots: 64
    group: 1
    copros:
      cuda: { max_quantity: 8, classes: [A] }
  hopper:
    time: 720
    max_size: 512
    max_slots: 96
    group: 1
    priority: 1
    copros:
      cuda: { max_quantity: 4, classes: [A, H] }
  ampere,hopper:
    time: 1440
    max_size: 512
    max_slots: 96
    group: 2
    copros:
      cuda: { max_quantity: 8, classes: [A, H] }
"#;

fn context() -> SubmissionContext {
    let at = NaiveDate::from_ymd_opt(2017, 10, 16)
        .unwrap()
        .and_hms_opt(5, 28, 38)
        .unwrap();
    SubmissionContext::at(at)
        .with_command_line("gridplan script -R 20 -T 30 ./analyse.sh")
        .with_tool_version("0.3.0")
        .with_modules(["mymodule"])
        .with_working_dir("/home/user/project")
}

#[test]
fn test_memory_expands_slots_on_short() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./analyse.sh"])
        .with_memory(MemoryRequest::total(20 * GB))
        .with_time(1800);

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.queue, "short");
    assert_eq!(plan.slots, 5);
    assert_eq!(plan.memory_per_slot_mb, 4 * GB);
    assert_eq!(plan.alternatives, vec!["long"]);
    assert!(plan.script.contains("#SBATCH --cpus-per-task=5\n"));
    assert!(plan.script.contains("#SBATCH --mem-per-cpu=4096\n"));
    assert!(plan.script.contains("#SBATCH --time=0-00:30:00\n"));
}

#[test]
fn test_priority_one_beats_priority_two() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./analyse.sh"]).with_group(1);

    let matched = planner.select(&request).unwrap();
    assert_eq!(matched.queue.name.to_string(), "short");
    assert_eq!(matched.queue.priority, 1);
    assert_eq!(matched.alternatives[0].priority, 2);
}

#[test]
fn test_long_job_falls_back_within_default_group() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./analyse.sh"]).with_time(86400);

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.queue, "long");
    assert!(plan.alternatives.is_empty());
}

#[test]
fn test_oversized_memory_reports_memory() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./analyse.sh"]).with_memory(MemoryRequest::total(100 * GB));

    let err = planner.plan(&request, &context()).unwrap_err();
    assert!(matches!(err, PlanError::NoMatchingQueue { .. }));
    assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Memory));
    assert!(err.to_string().contains("memory requirement cannot be met"));
}

#[test]
fn test_more_capable_classes_constrain_gpu() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./train.py"])
        .with_coprocessor(CoprocessorRequest::new("cuda").with_class("P"));

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.queue, "gpu");
    assert_eq!(
        plan.coprocessor[1],
        CoprocessorToken::Constraint {
            alternatives: vec!["p100".to_string(), "v100".to_string()]
        }
    );
    assert!(plan.script.contains("#SBATCH --gres=gpu:1\n"));
    assert!(plan.script.contains("#SBATCH --constraint=\"p100|v100\"\n"));

    let strict = request.with_include_more_capable(false);
    let plan = planner.plan(&strict, &context()).unwrap();
    assert!(plan.script.contains("#SBATCH --constraint=\"p100\"\n"));
}

#[test]
fn test_array_hold_falls_back_to_whole_job() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./step2.sh"])
        .with_name("step2")
        .with_array(ArraySpec::new(ArrayTasks::Count(8)).with_hold("1234"));

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(
        plan.warnings,
        vec![PlanWarning::ArrayHoldUnsupported {
            parents: vec!["1234".to_string()]
        }]
    );
    assert!(plan.script.contains("#SBATCH --array=1-8\n"));
    assert!(plan.script.contains("#SBATCH --dependency=afterok:1234\n"));
    assert!(plan.script.contains("#SBATCH -o /home/user/project/step2.o%A.%a\n"));
}

#[test]
fn test_mail_and_modules() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./analyse.sh"]).with_mail("user@example.com", Some("e"));

    let plan = planner.plan(&request, &context()).unwrap();
    assert!(plan.script.contains("#SBATCH --mail-user=user@example.com\n"));
    assert!(plan.script.contains("#SBATCH --mail-type=END\n"));
    assert!(plan
        .script
        .contains("module use /usr/local/shellmodules\nmodule load mymodule\n"));
    assert!(plan
        .script
        .contains("# Submission time (H:M:S DD/MM/YYYY): 05:28:38 16/10/2017\n"));
    assert!(plan.script.contains("# Preserved modules: mymodule\n"));
}

#[test]
fn test_host_qualified_queue() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::new(["./assemble.sh"])
        .with_queue("bigmem")
        .with_memory(MemoryRequest::total(80 * GB));

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.queue, "bigmem@node7");
    assert_eq!(plan.partitions, vec!["bigmem"]);
    assert!(plan.script.contains("#SBATCH -p bigmem\n#SBATCH -w node7\n"));
}

#[test]
fn test_task_file_array() {
    let planner = Planner::from_yaml_str(CLUSTER).unwrap();
    let request = JobRequest::from_task_file("subjects.txt", 25)
        .with_name("per subject")
        .with_array(ArraySpec::new(ArrayTasks::Count(25)).with_limit(5));

    let plan = planner.plan(&request, &context()).unwrap();
    assert!(plan.script.contains("#SBATCH --job-name=per_subject\n"));
    assert!(plan.script.contains("#SBATCH --array=1-25%5\n"));
    assert!(plan
        .script
        .ends_with("exec /bin/bash -c \"$the_command\"\n"));
}

#[test]
fn test_compound_queue_bounds() {
    let planner = Planner::from_yaml_str(GPU_CLUSTER).unwrap();
    let compound = planner.model().queue("ampere,hopper").unwrap();

    assert_eq!(compound.time_limit, 720 * 60);
    assert_eq!(compound.max_size, 256 * GB);
    assert_eq!(compound.max_slots, 64);
    let cuda = compound.coprocessor("cuda").unwrap();
    assert_eq!(cuda.max_quantity, 4);
    assert_eq!(cuda.classes, vec!["A"]);
}

#[test]
fn test_compound_queue_plan() {
    let planner = Planner::from_yaml_str(GPU_CLUSTER).unwrap();
    let request = JobRequest::new(["./train.py"])
        .with_queue("ampere,hopper")
        .with_coprocessor(CoprocessorRequest::new("cuda").with_quantity(2));

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.partitions, vec!["ampere", "hopper"]);
    assert!(plan.script.contains("#SBATCH -p ampere,hopper\n"));
    assert!(plan.script.contains("#SBATCH --gres=gpu:a100:2\n"));
    assert!(!plan.script.contains("--constraint"));

    let hopper_only = request.with_coprocessor(CoprocessorRequest::new("cuda").with_class("H"));
    let err = planner.plan(&hopper_only, &context()).unwrap_err();
    assert_eq!(err.unmet_dimension(), Some(UnmetDimension::Coprocessor));
}

#[test]
fn test_quantity_selection_picks_typed_gres() {
    let planner = Planner::from_yaml_str(GPU_CLUSTER).unwrap();
    let request = JobRequest::new(["./train.py"])
        .with_coprocessor(CoprocessorRequest::new("cuda").with_class("H"));

    let plan = planner.plan(&request, &context()).unwrap();
    assert_eq!(plan.queue, "hopper");
    assert_eq!(plan.coprocessor.len(), 1);
    assert!(plan.script.contains("#SBATCH --gres=gpu:h100:1\n"));
}

#[test]
fn test_no_default_queue_ranks_globally() {
    let planner = Planner::from_yaml_str(GPU_CLUSTER).unwrap();
    let request = JobRequest::new(["./train.py"])
        .with_coprocessor(CoprocessorRequest::new("cuda"))
        .with_time(600 * 60);

    let matched = planner.select(&request).unwrap();
    assert_eq!(matched.queue.name.to_string(), "ampere");
    assert_eq!(matched.alternatives.len(), 1);
    assert_eq!(matched.alternatives[0].name.to_string(), "hopper");
}
