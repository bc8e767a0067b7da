//! Gridplan: queue matching and Slurm submission planning
//!
//! This crate turns an abstract job resource request into a queue choice on a
//! heterogeneous cluster and a Slurm batch script that encodes that choice.
//!
//! # Overview
//!
//! Planning is a one-way pipeline over an immutable capability model:
//! 1. **Matching**: Pick the queue (partition) that fits slots, memory, time
//!    and accelerators, expanding slot counts to cover memory where queues
//!    allocate RAM per slot
//! 2. **Resolution**: Translate accelerator classes into GRES and node
//!    feature constraints, optionally accepting more capable classes
//! 3. **Synthesis**: Emit `#SBATCH` directives and a wrapper script
//!
//! The crate performs no I/O. Reading configuration files, collecting the
//! submitting environment and running `sbatch` are left to the caller.
//!
//! # Configuration
//!
//! | Section | Contents |
//! |---------|----------|
//! | `method_opts.slurm` | [`PlannerOptions`]: units, directive toggles, mail modes |
//! | `copro_opts` | Coprocessor types and their ranked classes |
//! | `queues` | Queue limits, groups and priorities; comma-joined names are compound queues |
//!
//! # Example
//!
//! ```ignore
//! use gridplan_sched::{JobRequest, MemoryRequest, Planner, SubmissionContext};
//!
//! let planner = Planner::from_yaml_str(&std::fs::read_to_string("cluster.yml")?)?;
//!
//! let request = JobRequest::new(["./analyse.sh", "subject01"])
//!     .with_name("analyse")
//!     .with_memory(MemoryRequest::total(20 * 1024))
//!     .with_time(30 * 60);
//!
//! let plan = planner.plan(&request, &SubmissionContext::now())?;
//! println!("{}", plan.script);
//! ```

pub mod capability;
pub mod config;
pub mod coprocessor;
pub mod error;
pub mod matcher;
pub mod planner;
pub mod request;
pub mod slurm;
pub mod units;

// Re-exports
pub use capability::{
    CapabilityModel, Capability, CoprocessorClass, CoprocessorType, QueueCoprocessor,
    QueueDefinition, QueueName, SelectionMode,
};
pub use config::{ClusterConfig, PlannerOptions};
pub use coprocessor::{CoprocessorToken, resolve_coprocessor};
pub use error::{PlanError, PlanResult, PlanWarning, UnmetDimension};
pub use matcher::{QueueMatch, select_queue};
pub use planner::Planner;
pub use request::{
    ArraySpec, ArrayTasks, CoprocessorRequest, JobRequest, MemoryRequest, MemoryScope, Payload,
};
pub use slurm::{Directive, SubmissionContext, SubmissionPlan, build_plan};
pub use units::{MemoryUnit, TimeFormat};
