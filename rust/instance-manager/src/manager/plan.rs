//! Plans, flavors and the JSON Schema of the instance parameters

use serde::Serialize;
use serde_json::json;
use snafu::{ResultExt, Snafu};
use stackable_operator::kube::ResourceExt;

use super::InstanceManager;
use crate::{
    crd::{RpaasFlavor, RpaasPlan},
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway, Selector},
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("failed to list plans"))]
    ListPlans { source: gateway::Error },

    #[snafu(display("failed to list flavors"))]
    ListFlavors { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::ListPlans { source } | Error::ListFlavors { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub name: String,
    pub description: String,
    pub default: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Flavor {
    pub name: String,
    pub description: String,
}

impl<G: Gateway> InstanceManager<G> {
    /// Plans of the service namespace, sorted by name
    pub async fn get_plans(&self) -> Result<Vec<Plan>, Error> {
        let opts = self.options();
        let mut plans = self
            .client
            .list::<RpaasPlan>(Some(&opts.service_name), &Selector::default())
            .await
            .context(error::ListPlansSnafu)?
            .into_iter()
            .map(|plan| Plan {
                name: plan.name_any(),
                description: plan.spec.description.unwrap_or_default(),
                default: plan.spec.default,
            })
            .collect::<Vec<_>>();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(plans)
    }

    /// Flavors users may choose, default flavors are applied implicitly and left out
    pub async fn get_flavors(&self) -> Result<Vec<Flavor>, Error> {
        let opts = self.options();
        let mut flavors = self
            .client
            .list::<RpaasFlavor>(Some(&opts.service_name), &Selector::default())
            .await
            .context(error::ListFlavorsSnafu)?
            .into_iter()
            .filter(|flavor| !flavor.spec.default)
            .map(|flavor| Flavor {
                name: flavor.name_any(),
                description: flavor.spec.description.unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        flavors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(flavors)
    }

    pub async fn plan_parameters_schema(&self) -> Result<serde_json::Value, Error> {
        let flavors = self
            .get_flavors()
            .await?
            .into_iter()
            .map(|flavor| flavor.name)
            .collect::<Vec<_>>();
        Ok(json!({
            "$schema": "https://json-schema.org/draft-07/schema#",
            "type": "object",
            "properties": {
                "flavors": {
                    "type": "array",
                    "description": "Flavors applied to the instance",
                    "items": {
                        "type": "string",
                        "enum": flavors,
                    },
                },
                "ip": {
                    "type": "string",
                    "description": "IP address of the load balancer",
                },
                "lb-name": {
                    "type": "string",
                    "description": "Name of the load balancer",
                },
                "plan-override": {
                    "type": "object",
                    "description": "Fields overriding the plan",
                },
            },
        }))
    }
}
