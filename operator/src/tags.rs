//! Resource overrides carried as model version tags.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::ResourceRequirements, apimachinery::pkg::api::resource::Quantity,
};
use tracing::warn;

use crate::{quantity::to_quantity, registry::ModelVersionTag};

pub const CPU_REQUEST_TAG: &str = "mlflowOperator-cpuRequest";
pub const CPU_LIMIT_TAG: &str = "mlflowOperator-cpuLimit";
pub const MEMORY_REQUEST_TAG: &str = "mlflowOperator-memoryRequest";
pub const MEMORY_LIMIT_TAG: &str = "mlflowOperator-memoryLimit";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatorTags {
    pub cpu_request: Option<Quantity>,
    pub cpu_limit: Option<Quantity>,
    pub memory_request: Option<Quantity>,
    pub memory_limit: Option<Quantity>,
}

impl OperatorTags {
    /// Picks the reserved keys out of `tags`. Values that are not valid
    /// quantities leave their field unset.
    pub fn parse(tags: &[ModelVersionTag]) -> Self {
        let mut parsed = Self::default();
        for tag in tags {
            let field = match tag.key.as_str() {
                CPU_REQUEST_TAG => &mut parsed.cpu_request,
                CPU_LIMIT_TAG => &mut parsed.cpu_limit,
                MEMORY_REQUEST_TAG => &mut parsed.memory_request,
                MEMORY_LIMIT_TAG => &mut parsed.memory_limit,
                _ => continue,
            };
            match to_quantity(&tag.value) {
                Some(q) => *field = Some(q),
                None => warn!(key = %tag.key, value = %tag.value, "ignoring invalid quantity tag"),
            }
        }
        parsed
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    /// Container resources for the set fields, `None` when nothing is set.
    pub fn resources(&self) -> Option<ResourceRequirements> {
        if self.is_empty() {
            return None;
        }

        let list = |cpu: &Option<Quantity>, memory: &Option<Quantity>| {
            let mut list = BTreeMap::new();
            if let Some(cpu) = cpu {
                list.insert("cpu".to_string(), cpu.clone());
            }
            if let Some(memory) = memory {
                list.insert("memory".to_string(), memory.clone());
            }
            (!list.is_empty()).then_some(list)
        };

        Some(ResourceRequirements {
            requests: list(&self.cpu_request, &self.memory_request),
            limits: list(&self.cpu_limit, &self.memory_limit),
            ..Default::default()
        })
    }
}
