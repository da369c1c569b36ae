//! Creating, updating, scaling and deleting instances

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Namespace, apimachinery::pkg::apis::meta::v1::ObjectMeta},
    kube::{runtime::reflector::ObjectRef, ResourceExt},
};

use super::{namespace_of, GetInstanceError, InstanceManager};
use crate::{
    config::RuntimeOptions,
    crd::{
        PodTemplateSpec, RpaasFlavor, RpaasInstance, RpaasInstanceSpec, RpaasPlan, RpaasPlanSpec,
        ServiceSpec,
    },
    error::{ErrorKind, ManagerError},
    gateway::{self, Gateway, Selector},
    labels, validation,
};

const PARAMETER_FLAVORS: &str = "flavors";
const PARAMETER_IP: &str = "ip";
const PARAMETER_LB_NAME: &str = "lb-name";
const PARAMETER_PLAN_OVERRIDE: &str = "plan-override";

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid instance"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("rpaas instance named {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("failed to load plans from namespace {namespace:?}"))]
    LoadPlans {
        source: gateway::Error,
        namespace: String,
    },

    #[snafu(display("invalid plan {plan:?}"))]
    InvalidPlan { plan: String },

    #[snafu(display("no default plan found in namespace {namespace:?}"))]
    NoDefaultPlan { namespace: String },

    #[snafu(display("multiple default plans found in namespace {namespace:?}: {}", plans.join(", ")))]
    MultipleDefaultPlans {
        namespace: String,
        plans: Vec<String>,
    },

    #[snafu(display("failed to load flavor {flavor:?}"))]
    LoadFlavor {
        source: gateway::Error,
        flavor: String,
    },

    #[snafu(display("flavor {flavor:?} not found"))]
    FlavorNotFound { flavor: String },

    #[snafu(display("flavor {flavor:?} was selected more than once"))]
    DuplicateFlavor { flavor: String },

    #[snafu(display("flavor {flavor:?} can only be used when creating an instance"))]
    CreationOnlyFlavor { flavor: String },

    #[snafu(display("flavor {flavor:?} cannot be combined with {other:?}"))]
    IncompatibleFlavors { flavor: String, other: String },

    #[snafu(display("invalid value for parameter {parameter:?}"))]
    InvalidParameter { parameter: String },

    #[snafu(display("invalid plan-override"))]
    InvalidPlanOverride { source: serde_json::Error },

    #[snafu(display("failed to create namespace {namespace:?}"))]
    CreateNamespace {
        source: gateway::Error,
        namespace: String,
    },

    #[snafu(display("failed to create rpaas instance {name:?}"))]
    CreateInstance {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },

    #[snafu(display("failed to delete rpaas instance"))]
    DeleteInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::AlreadyExists { .. } => ErrorKind::Conflict,
            Error::InvalidPlan { .. } => ErrorKind::Validation,
            Error::NoDefaultPlan { .. } => ErrorKind::NotFound,
            Error::MultipleDefaultPlans { .. } => ErrorKind::Conflict,
            Error::FlavorNotFound { .. }
            | Error::DuplicateFlavor { .. }
            | Error::CreationOnlyFlavor { .. }
            | Error::IncompatibleFlavors { .. }
            | Error::InvalidParameter { .. }
            | Error::InvalidPlanOverride { .. } => ErrorKind::Validation,
            Error::LoadPlans { source, .. }
            | Error::LoadFlavor { source, .. }
            | Error::CreateNamespace { source, .. }
            | Error::PatchInstance { source }
            | Error::DeleteInstance { source } => source.kind(),
            Error::CreateInstance { source, .. } if source.is_already_exists() => {
                ErrorKind::Conflict
            }
            Error::CreateInstance { source, .. } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateArgs {
    pub name: String,
    pub team: String,
    /// Falls back to the default plan of the namespace
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateArgs {
    /// Left unset, the current team is kept
    #[serde(default)]
    pub team: Option<String>,
    /// Left unset, the current plan is kept
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Fields derived from tags and parameters on every write
#[derive(Debug, Default, PartialEq)]
struct Derived {
    /// [`None`] when neither tags nor parameters mention flavors
    flavors: Option<Vec<String>>,
    ip: Option<String>,
    lb_name: Option<String>,
    plan_override: Option<RpaasPlanSpec>,
}

fn parameter_string(parameter: &str, value: &serde_json::Value) -> Result<String, Error> {
    match value {
        serde_json::Value::String(value) => Ok(value.clone()),
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::Number(_) | serde_json::Value::Bool(_) => Ok(value.to_string()),
        _ => error::InvalidParameterSnafu { parameter }.fail(),
    }
}

fn split_flavors(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|flavor| !flavor.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parameters take precedence over the `key=value` tag convention
fn derive(tags: &[String], parameters: &BTreeMap<String, serde_json::Value>) -> Result<Derived, Error> {
    let mut raw = BTreeMap::<&str, String>::new();
    for tag in tags {
        if let Some((key, value)) = tag.split_once('=') {
            let key = match key.trim() {
                "flavor" | PARAMETER_FLAVORS => PARAMETER_FLAVORS,
                PARAMETER_IP => PARAMETER_IP,
                PARAMETER_LB_NAME => PARAMETER_LB_NAME,
                PARAMETER_PLAN_OVERRIDE => PARAMETER_PLAN_OVERRIDE,
                _ => continue,
            };
            raw.insert(key, value.trim().to_string());
        }
    }

    let mut flavors = raw.remove(PARAMETER_FLAVORS).map(|raw| split_flavors(&raw));
    let mut plan_override = None;
    if let Some(value) = parameters.get(PARAMETER_FLAVORS) {
        flavors = Some(match value {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| parameter_string(PARAMETER_FLAVORS, item))
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .filter(|flavor| !flavor.is_empty())
                .collect(),
            other => split_flavors(&parameter_string(PARAMETER_FLAVORS, other)?),
        });
    }
    for key in [PARAMETER_IP, PARAMETER_LB_NAME] {
        if let Some(value) = parameters.get(key) {
            raw.insert(key, parameter_string(key, value)?);
        }
    }
    match parameters.get(PARAMETER_PLAN_OVERRIDE) {
        Some(serde_json::Value::Object(fields)) if !fields.is_empty() => {
            plan_override = Some(
                serde_json::from_value(serde_json::Value::Object(fields.clone()))
                    .context(error::InvalidPlanOverrideSnafu)?,
            );
        }
        Some(value) => {
            raw.insert(
                PARAMETER_PLAN_OVERRIDE,
                parameter_string(PARAMETER_PLAN_OVERRIDE, value)?,
            );
        }
        None => {}
    }
    if plan_override.is_none() {
        if let Some(json) = raw.remove(PARAMETER_PLAN_OVERRIDE).filter(|json| !json.is_empty()) {
            plan_override =
                Some(serde_json::from_str(&json).context(error::InvalidPlanOverrideSnafu)?);
        }
    }

    Ok(Derived {
        flavors,
        ip: raw.remove(PARAMETER_IP).filter(|ip| !ip.is_empty()),
        lb_name: raw.remove(PARAMETER_LB_NAME).filter(|name| !name.is_empty()),
        plan_override,
    })
}

fn apply_derived(spec: &mut RpaasInstanceSpec, derived: Derived, opts: &RuntimeOptions) {
    if let Some(flavors) = derived.flavors {
        spec.flavors = flavors;
    }
    spec.plan_template = derived.plan_override;

    let needs_service = derived.ip.is_some() || derived.lb_name.is_some();
    if spec.service.is_none() && !needs_service {
        return;
    }
    let service = spec.service.get_or_insert_with(ServiceSpec::default);
    service.load_balancer_ip = derived.ip;
    match (&opts.load_balancer_name_label_key, derived.lb_name) {
        (Some(key), Some(lb_name)) => {
            service.annotations.insert(key.clone(), lb_name);
        }
        (Some(key), None) => {
            service.annotations.remove(key);
        }
        (None, Some(_)) => {
            tracing::warn!("ignoring lb-name, no load balancer name annotation is configured")
        }
        (None, None) => {}
    }
}

fn set_team(instance: &mut RpaasInstance, team: &str) {
    instance
        .labels_mut()
        .insert(labels::LABEL_TEAM_OWNER.to_string(), team.to_string());
    instance
        .annotations_mut()
        .insert(labels::ANNOTATION_TEAM_OWNER.to_string(), team.to_string());
    instance
        .spec
        .pod_template
        .labels
        .insert(labels::LABEL_TEAM_OWNER.to_string(), team.to_string());
}

fn set_description(instance: &mut RpaasInstance, description: Option<&str>) {
    match description.filter(|description| !description.is_empty()) {
        Some(description) => {
            instance.annotations_mut().insert(
                labels::ANNOTATION_DESCRIPTION.to_string(),
                description.to_string(),
            );
        }
        None => {
            instance
                .annotations_mut()
                .remove(labels::ANNOTATION_DESCRIPTION);
        }
    }
}

fn set_tags(instance: &mut RpaasInstance, tags: &[String]) {
    let tags = tags
        .iter()
        .map(|tag| tag.trim())
        .filter(|tag| !tag.is_empty())
        .collect::<Vec<_>>();
    if tags.is_empty() {
        instance.annotations_mut().remove(labels::ANNOTATION_TAGS);
    } else {
        instance
            .annotations_mut()
            .insert(labels::ANNOTATION_TAGS.to_string(), tags.join(","));
    }
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn create_instance(&self, args: CreateArgs) -> Result<RpaasInstance, Error> {
        let opts = self.options();
        validation::instance_name(&args.name).context(error::ValidationSnafu)?;
        validation::team(&args.team).context(error::ValidationSnafu)?;
        let namespace = labels::namespace_for(&opts, args.pool.as_deref());

        let plan = self.resolve_plan(&namespace, args.plan.as_deref()).await?;
        match self.find_instance(&opts, &args.name).await {
            Ok(_) => return error::AlreadyExistsSnafu { name: &args.name }.fail(),
            Err(GetInstanceError::NotFound { .. }) => {}
            Err(source) => return Err(Error::GetInstance { source }),
        }
        let derived = derive(&args.tags, &args.parameters)?;
        let flavors = derived.flavors.clone().unwrap_or_default();
        self.validate_flavors(&namespace, &[], &flavors, true).await?;

        self.ensure_namespace(&namespace).await?;

        let mut pod_labels = labels::instance_labels(&opts.service_name, &args.name);
        pod_labels.insert(labels::LABEL_TEAM_OWNER.to_string(), args.team.clone());
        let mut instance = RpaasInstance::new(
            &args.name,
            RpaasInstanceSpec {
                replicas: Some(1),
                plan_name: plan.name_any(),
                service: Some(ServiceSpec {
                    type_: Some("LoadBalancer".to_string()),
                    ..Default::default()
                }),
                pod_template: PodTemplateSpec {
                    labels: pod_labels,
                    affinity: opts.affinity_for_team(&args.team).cloned(),
                    ..Default::default()
                },
                rollout_nginx_once: true,
                ..Default::default()
            },
        );
        instance.metadata = ObjectMeta {
            name: Some(args.name.clone()),
            namespace: Some(namespace),
            labels: Some(labels::instance_labels(&opts.service_name, &args.name)),
            ..Default::default()
        };
        if let Some(cluster) = args.cluster.as_deref().filter(|cluster| !cluster.is_empty()) {
            instance
                .labels_mut()
                .insert(labels::LABEL_CLUSTER_NAME.to_string(), cluster.to_string());
        }
        set_team(&mut instance, &args.team);
        set_description(&mut instance, args.description.as_deref());
        set_tags(&mut instance, &args.tags);
        apply_derived(&mut instance.spec, derived, &opts);

        let created = self
            .client
            .create(&instance)
            .await
            .context(error::CreateInstanceSnafu { name: &args.name })?;
        tracing::info!(
            instance = %ObjectRef::from_obj(&created),
            plan = %created.spec.plan_name,
            "created rpaas instance"
        );
        Ok(created)
    }

    pub async fn update_instance(&self, name: &str, args: UpdateArgs) -> Result<RpaasInstance, Error> {
        let opts = self.options();
        let original = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        let namespace = namespace_of(&original);
        let mut target = original.clone();

        if let Some(plan) = args.plan.as_deref().filter(|plan| !plan.is_empty()) {
            if plan != original.spec.plan_name {
                self.resolve_plan(&namespace, Some(plan)).await?;
                target.spec.plan_name = plan.to_string();
            }
        }
        if let Some(team) = args.team.as_deref().filter(|team| !team.is_empty()) {
            set_team(&mut target, team);
        }
        set_description(&mut target, args.description.as_deref());
        set_tags(&mut target, &args.tags);

        let derived = derive(&args.tags, &args.parameters)?;
        if let Some(flavors) = &derived.flavors {
            self.validate_flavors(&namespace, &original.spec.flavors, flavors, false)
                .await?;
        }
        apply_derived(&mut target.spec, derived, &opts);

        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)
    }

    pub async fn delete_instance(&self, name: &str) -> Result<(), Error> {
        let opts = self.options();
        let instance = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        self.client
            .delete(&instance)
            .await
            .context(error::DeleteInstanceSnafu)?;
        tracing::info!(instance = %ObjectRef::from_obj(&instance), "deleted rpaas instance");
        Ok(())
    }

    pub async fn scale(&self, name: &str, replicas: i32) -> Result<RpaasInstance, Error> {
        validation::replicas(replicas).context(error::ValidationSnafu)?;
        let original = self.get_instance(name).await.context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        target.spec.replicas = Some(replicas);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)
    }

    /// The named plan, or the single default plan of `namespace`
    async fn resolve_plan(&self, namespace: &str, plan: Option<&str>) -> Result<RpaasPlan, Error> {
        if let Some(plan) = plan.filter(|plan| !plan.is_empty()) {
            return self
                .client
                .get_opt::<RpaasPlan>(namespace, plan)
                .await
                .context(error::LoadPlansSnafu { namespace })?
                .context(error::InvalidPlanSnafu { plan });
        }
        let mut defaults = self
            .client
            .list::<RpaasPlan>(Some(namespace), &Selector::default())
            .await
            .context(error::LoadPlansSnafu { namespace })?
            .into_iter()
            .filter(|plan| plan.spec.default)
            .collect::<Vec<_>>();
        match defaults.len() {
            0 => error::NoDefaultPlanSnafu { namespace }.fail(),
            1 => Ok(defaults.remove(0)),
            _ => error::MultipleDefaultPlansSnafu {
                namespace,
                plans: defaults.iter().map(ResourceExt::name_any).collect::<Vec<_>>(),
            }
            .fail(),
        }
    }

    async fn validate_flavors(
        &self,
        namespace: &str,
        current: &[String],
        requested: &[String],
        creating: bool,
    ) -> Result<(), Error> {
        let mut seen = BTreeSet::new();
        for flavor in requested {
            ensure!(seen.insert(flavor), error::DuplicateFlavorSnafu { flavor });
        }
        let mut flavors = Vec::with_capacity(requested.len());
        for name in requested {
            let flavor = self
                .client
                .get_opt::<RpaasFlavor>(namespace, name)
                .await
                .context(error::LoadFlavorSnafu { flavor: name })?
                .context(error::FlavorNotFoundSnafu { flavor: name })?;
            ensure!(
                creating || current.contains(name) || !flavor.spec.creation_only,
                error::CreationOnlyFlavorSnafu { flavor: name }
            );
            flavors.push(flavor);
        }
        for flavor in &flavors {
            for other in &flavors {
                let other_name = other.name_any();
                if flavor.spec.incompatible_flavors.contains(&other_name) {
                    return error::IncompatibleFlavorsSnafu {
                        flavor: flavor.name_any(),
                        other: other_name,
                    }
                    .fail();
                }
            }
        }
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<(), Error> {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        match self.client.create(&ns).await {
            Ok(_) => {
                tracing::info!(namespace, "created namespace");
                Ok(())
            }
            Err(err) if err.is_already_exists() => Ok(()),
            Err(source) => Err(Error::CreateNamespace {
                source,
                namespace: namespace.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use stackable_operator::k8s_openapi::api::core::v1::{Affinity, Namespace, NodeAffinity};

    use super::{derive, CreateArgs, UpdateArgs};
    use crate::{
        crd::{RpaasFlavorSpec, RpaasInstance},
        error::{ErrorKind, ManagerError},
        labels,
        manager::test_util::{flavor, instance, manager, plan, Cluster, SERVICE},
    };

    fn create_args(name: &str, team: &str) -> CreateArgs {
        CreateArgs {
            name: name.to_string(),
            team: team.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_with_default_plan() {
        let cluster = Cluster::new();
        cluster.gateway.insert(plan("plan1", true));
        cluster.gateway.insert(plan("plan2", false));
        let manager = manager(&cluster);

        manager.create_instance(create_args("r1", "t1")).await.unwrap();

        let created = cluster.instance("r1");
        assert_eq!(created.spec.replicas, Some(1));
        assert_eq!(created.spec.plan_name, "plan1");
        assert!(created.spec.rollout_nginx_once);
        assert_eq!(
            created.spec.service.as_ref().unwrap().type_.as_deref(),
            Some("LoadBalancer")
        );
        let instance_labels = created.metadata.labels.as_ref().unwrap();
        assert_eq!(instance_labels[labels::LABEL_SERVICE_NAME], SERVICE);
        assert_eq!(instance_labels[labels::LABEL_INSTANCE_NAME], "r1");
        assert_eq!(instance_labels[labels::LABEL_TEAM_OWNER], "t1");
        assert_eq!(instance_labels[labels::LEGACY_LABEL_INSTANCE], "r1");
        assert_eq!(
            created.metadata.annotations.as_ref().unwrap()[labels::ANNOTATION_TEAM_OWNER],
            "t1"
        );
        assert_eq!(created.spec.pod_template.labels[labels::LABEL_TEAM_OWNER], "t1");
        assert_eq!(created.team(), Some("t1"));
        assert!(cluster.gateway.object::<Namespace>("", SERVICE).is_some());

        let err = manager
            .create_instance(create_args("r1", "t1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn create_requires_exactly_one_default_plan() {
        let cluster = Cluster::new();
        let manager = manager(&cluster);
        let err = manager
            .create_instance(create_args("r1", "t1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        cluster.gateway.insert(plan("plan1", true));
        cluster.gateway.insert(plan("plan2", true));
        let err = manager
            .create_instance(create_args("r1", "t1"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = manager
            .create_instance(CreateArgs {
                plan: Some("unknown".to_string()),
                ..create_args("r1", "t1")
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(manager
            .create_instance(CreateArgs {
                plan: Some("plan2".to_string()),
                ..create_args("r1", "t1")
            })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn create_validates_input() {
        let cluster = Cluster::new();
        cluster.gateway.insert(plan("plan1", true));
        let manager = manager(&cluster);
        for args in [
            create_args(&"a".repeat(31), "t1"),
            create_args("Invalid_Name", "t1"),
            create_args("r1", ""),
        ] {
            let err = manager.create_instance(args).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        assert!(manager
            .create_instance(create_args(&"a".repeat(30), "t1"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn create_with_team_affinity() {
        let mut cluster = Cluster::new();
        cluster.gateway.insert(plan("plan1", true));
        let affinity_a = Affinity {
            node_affinity: Some(NodeAffinity::default()),
            ..Default::default()
        };
        cluster.options.default_affinity = Some(Affinity::default());
        cluster
            .options
            .team_affinity
            .insert("team-one".to_string(), affinity_a.clone());
        let manager = manager(&cluster);

        manager
            .create_instance(create_args("r1", "team-one"))
            .await
            .unwrap();
        manager
            .create_instance(create_args("r2", "team-two"))
            .await
            .unwrap();
        assert_eq!(cluster.instance("r1").spec.pod_template.affinity, Some(affinity_a));
        assert_eq!(
            cluster.instance("r2").spec.pod_template.affinity,
            Some(Affinity::default())
        );
    }

    #[tokio::test]
    async fn create_in_pool_namespace() {
        let cluster = Cluster::namespaced();
        let mut pool_plan = plan("plan1", true);
        pool_plan.metadata.namespace = Some("rpaasv2-pool-a".to_string());
        cluster.gateway.insert(pool_plan);
        let manager = manager(&cluster);
        let created = manager
            .create_instance(CreateArgs {
                pool: Some("pool-a".to_string()),
                cluster: Some("cluster-1".to_string()),
                ..create_args("r1", "t1")
            })
            .await
            .unwrap();
        assert_eq!(created.metadata.namespace.as_deref(), Some("rpaasv2-pool-a"));
        assert_eq!(created.cluster_name(), Some("cluster-1"));
        assert!(cluster
            .gateway
            .object::<RpaasInstance>("rpaasv2-pool-a", "r1")
            .is_some());
        assert!(manager.get_instance("r1").await.is_ok());
    }

    #[tokio::test]
    async fn create_derives_fields_from_tags_and_parameters() {
        let mut cluster = Cluster::new();
        cluster.options.load_balancer_name_label_key =
            Some("cloudprovider.example.com/lb-name".to_string());
        cluster.gateway.insert(plan("plan1", true));
        cluster.gateway.insert(flavor("orange", RpaasFlavorSpec::default()));
        cluster.gateway.insert(flavor("mango", RpaasFlavorSpec::default()));
        let manager = manager(&cluster);

        let created = manager
            .create_instance(CreateArgs {
                tags: vec!["tag1".to_string(), "ip=10.1.1.1".to_string()],
                description: Some("my proxy".to_string()),
                parameters: BTreeMap::from([
                    ("flavors".to_string(), json!(["orange", "mango"])),
                    ("lb-name".to_string(), json!("my-lb")),
                    ("plan-override".to_string(), json!({"image": "nginx:custom"})),
                ]),
                ..create_args("r1", "t1")
            })
            .await
            .unwrap();
        let service = created.spec.service.as_ref().unwrap();
        assert_eq!(service.load_balancer_ip.as_deref(), Some("10.1.1.1"));
        assert_eq!(service.annotations["cloudprovider.example.com/lb-name"], "my-lb");
        assert_eq!(created.spec.flavors, vec!["orange", "mango"]);
        assert_eq!(
            created.spec.plan_template.as_ref().unwrap().image.as_deref(),
            Some("nginx:custom")
        );
        assert_eq!(created.tags(), vec!["tag1", "ip=10.1.1.1"]);
        assert_eq!(created.description(), Some("my proxy"));

        let updated = manager
            .update_instance(
                "r1",
                UpdateArgs {
                    tags: vec!["tag1".to_string()],
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let service = updated.spec.service.as_ref().unwrap();
        assert_eq!(service.load_balancer_ip, None);
        assert!(service.annotations.is_empty());
        assert_eq!(updated.spec.plan_template, None);
        assert_eq!(updated.spec.flavors, vec!["orange", "mango"]);
        assert_eq!(updated.description(), None);
    }

    #[tokio::test]
    async fn flavor_rules() {
        let cluster = Cluster::new();
        cluster.gateway.insert(plan("plan1", true));
        cluster.gateway.insert(flavor(
            "strawberry",
            RpaasFlavorSpec {
                creation_only: true,
                ..Default::default()
            },
        ));
        cluster.gateway.insert(flavor(
            "banana",
            RpaasFlavorSpec {
                incompatible_flavors: vec!["orange".to_string()],
                ..Default::default()
            },
        ));
        cluster.gateway.insert(flavor("orange", RpaasFlavorSpec::default()));
        let manager = manager(&cluster);

        for flavors in [json!(["missing"]), json!(["orange", "orange"]), json!("banana,orange")] {
            let err = manager
                .create_instance(CreateArgs {
                    parameters: BTreeMap::from([("flavors".to_string(), flavors)]),
                    ..create_args("r1", "t1")
                })
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{err}");
        }

        manager
            .create_instance(CreateArgs {
                tags: vec!["flavor=strawberry".to_string()],
                ..create_args("r1", "t1")
            })
            .await
            .unwrap();
        manager.create_instance(create_args("r2", "t1")).await.unwrap();

        let add_strawberry = UpdateArgs {
            tags: vec!["flavors=strawberry,orange".to_string()],
            ..Default::default()
        };
        let err = manager
            .update_instance("r2", add_strawberry.clone())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let updated = manager.update_instance("r1", add_strawberry).await.unwrap();
        assert_eq!(updated.spec.flavors, vec!["strawberry", "orange"]);
    }

    #[tokio::test]
    async fn update_team_and_plan() {
        let cluster = Cluster::new();
        cluster.gateway.insert(plan("basic", true));
        cluster.gateway.insert(plan("large", false));
        cluster.gateway.insert(instance("r1"));
        let manager = manager(&cluster);

        let err = manager
            .update_instance(
                "r1",
                UpdateArgs {
                    plan: Some("huge".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let updated = manager
            .update_instance(
                "r1",
                UpdateArgs {
                    plan: Some("large".to_string()),
                    team: Some("team-two".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.spec.plan_name, "large");
        assert_eq!(updated.team(), Some("team-two"));
        assert_eq!(
            updated.metadata.labels.as_ref().unwrap()[labels::LABEL_TEAM_OWNER],
            "team-two"
        );
        assert_eq!(updated.spec.pod_template.labels[labels::LABEL_TEAM_OWNER], "team-two");

        let err = manager
            .update_instance("missing", UpdateArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn scale_and_delete() {
        let cluster = Cluster::new();
        cluster.gateway.insert(instance("r1"));
        let manager = manager(&cluster);

        assert_eq!(manager.scale("r1", -1).await.unwrap_err().kind(), ErrorKind::Validation);
        manager.scale("r1", 0).await.unwrap();
        assert_eq!(cluster.instance("r1").spec.replicas, Some(0));

        manager.delete_instance("r1").await.unwrap();
        assert!(cluster.gateway.object::<RpaasInstance>(SERVICE, "r1").is_none());
        assert_eq!(
            manager.delete_instance("r1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn concurrent_updates_conflict() {
        let cluster = Cluster::new();
        let original = cluster.gateway.insert(instance("r1"));
        let manager = manager(&cluster);
        manager.scale("r1", 3).await.unwrap();

        let mut stale_target = original.clone();
        stale_target.spec.replicas = Some(5);
        let err = manager.patch_instance(&original, &stale_target).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.instance("r1").spec.replicas, Some(3));
    }

    #[test]
    fn derived_fields() {
        let derived = derive(
            &[
                "flavor=a, b".to_string(),
                "ip=".to_string(),
                r#"plan-override={"image": "nginx:test"}"#.to_string(),
            ],
            &BTreeMap::new(),
        )
        .unwrap();
        assert_eq!(derived.flavors, Some(vec!["a".to_string(), "b".to_string()]));
        assert_eq!(derived.ip, None);
        assert_eq!(
            derived.plan_override.unwrap().image.as_deref(),
            Some("nginx:test")
        );

        let derived = derive(&["plain".to_string()], &BTreeMap::new()).unwrap();
        assert_eq!(derived.flavors, None);

        assert!(derive(&["plan-override={".to_string()], &BTreeMap::new()).is_err());
        assert!(derive(
            &[],
            &BTreeMap::from([("ip".to_string(), json!({"nested": true}))])
        )
        .is_err());
    }
}
