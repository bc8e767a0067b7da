//! End-to-end planning: queue selection, coprocessor resolution, script.

use std::sync::Arc;

use tracing::info;

use crate::capability::CapabilityModel;
use crate::config::{ClusterConfig, PlannerOptions};
use crate::coprocessor::resolve_coprocessor;
use crate::error::PlanResult;
use crate::matcher::{QueueMatch, select_queue};
use crate::request::JobRequest;
use crate::slurm::{SubmissionContext, SubmissionPlan, build_plan};

/// Plans jobs against one cluster.
///
/// The model is shared behind an `Arc`, so a planner is cheap to clone and
/// can be used from several threads at once.
#[derive(Debug, Clone)]
pub struct Planner {
    model: Arc<CapabilityModel>,
    options: PlannerOptions,
}

impl Planner {
    /// Create a planner from a built model.
    pub fn new(model: CapabilityModel, options: PlannerOptions) -> Self {
        Self {
            model: Arc::new(model),
            options,
        }
    }

    /// Create a planner from parsed configuration.
    pub fn from_config(config: &ClusterConfig) -> PlanResult<Self> {
        Ok(Self::new(config.build_model()?, config.options()))
    }

    /// Create a planner from YAML configuration text.
    pub fn from_yaml_str(yaml: &str) -> PlanResult<Self> {
        Self::from_config(&ClusterConfig::from_yaml_str(yaml)?)
    }

    /// The capability model.
    pub fn model(&self) -> &CapabilityModel {
        &self.model
    }

    /// The method options.
    pub fn options(&self) -> &PlannerOptions {
        &self.options
    }

    /// Choose a queue without building a plan.
    pub fn select(&self, request: &JobRequest) -> PlanResult<QueueMatch<'_>> {
        select_queue(request, &self.model, &self.options)
    }

    /// Plan a job.
    pub fn plan(
        &self,
        request: &JobRequest,
        context: &SubmissionContext,
    ) -> PlanResult<SubmissionPlan> {
        info!("Planning job {}", request.name);

        let matched = self.select(request)?;

        let tokens = match request.coprocessor {
            Some(ref copro) => resolve_coprocessor(
                copro,
                matched.queue,
                &self.model,
                request.include_more_capable,
            )?,
            None => Vec::new(),
        };

        let plan = build_plan(request, &matched, &tokens, &self.options, context)?;

        info!(
            "Job {} planned on {} with {} slot(s)",
            request.name, plan.queue, plan.slots
        );
        for warning in &plan.warnings {
            info!("{}", warning);
        }

        Ok(plan)
    }
}
