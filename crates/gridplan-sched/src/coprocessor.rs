//! Translation of accelerator requests into scheduler resource tokens.

use serde::Serialize;
use tracing::debug;

use crate::capability::{CapabilityModel, QueueDefinition, SelectionMode};
use crate::error::{PlanError, PlanResult};
use crate::request::CoprocessorRequest;

/// A scheduler-level coprocessor requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoprocessorToken {
    /// Generic resource, optionally typed: `gpu:2` or `gpu:p100:2`.
    Gres {
        resource: String,
        class: Option<String>,
        quantity: u32,
    },
    /// Node features, any of which is acceptable: `p100|v100`.
    Constraint { alternatives: Vec<String> },
}

impl std::fmt::Display for CoprocessorToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoprocessorToken::Gres {
                resource,
                class: Some(class),
                quantity,
            } => write!(f, "{resource}:{class}:{quantity}"),
            CoprocessorToken::Gres {
                resource,
                class: None,
                quantity,
            } => write!(f, "{resource}:{quantity}"),
            CoprocessorToken::Constraint { alternatives } => f.write_str(&alternatives.join("|")),
        }
    }
}

/// Resolve a coprocessor request against the chosen queue.
///
/// `include_more_capable` only widens the request when the coprocessor type
/// also allows it and selects classes by constraint.
pub fn resolve_coprocessor(
    request: &CoprocessorRequest,
    queue: &QueueDefinition,
    model: &CapabilityModel,
    include_more_capable: bool,
) -> PlanResult<Vec<CoprocessorToken>> {
    let ctype = model
        .coprocessor(&request.name)
        .ok_or_else(|| PlanError::UnknownCoprocessor(request.name.clone()))?;

    let unavailable = |class: &str| PlanError::ClassUnavailableOnQueue {
        queue: queue.name.to_string(),
        coprocessor: request.name.clone(),
        class: class.to_string(),
    };

    let entry = queue
        .coprocessor(&request.name)
        .ok_or_else(|| unavailable(request.class.as_deref().unwrap_or("any")))?;

    let untyped = CoprocessorToken::Gres {
        resource: ctype.resource.clone(),
        class: None,
        quantity: request.quantity,
    };

    let Some(class) = ctype.resolve_class(request.class.as_deref())? else {
        return Ok(vec![untyped]);
    };

    match ctype.selection {
        SelectionMode::Constraint => {
            let include = include_more_capable && ctype.include_more_capable;
            let alternatives: Vec<String> = ctype
                .qualifying_classes(class, include)
                .into_iter()
                .filter(|c| entry.offers(&c.selector))
                .map(|c| c.resource.clone())
                .collect();

            if alternatives.is_empty() {
                return Err(unavailable(&class.selector));
            }

            debug!(
                "Constraining {} to {} on {}",
                request.name,
                alternatives.join("|"),
                queue.name
            );
            Ok(vec![untyped, CoprocessorToken::Constraint { alternatives }])
        }
        SelectionMode::Quantity => {
            if include_more_capable && ctype.include_more_capable {
                debug!(
                    "Ignoring more capable classes for {}: quantity selection takes one class",
                    request.name
                );
            }
            if !entry.offers(&class.selector) {
                return Err(unavailable(&class.selector));
            }
            Ok(vec![CoprocessorToken::Gres {
                resource: ctype.resource.clone(),
                class: Some(class.resource.clone()),
                quantity: request.quantity,
            }])
        }
    }
}
