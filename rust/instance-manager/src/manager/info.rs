//! Read views composing an instance with the cluster state derived from it

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::Serialize;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    cpu::CpuQuantity,
    k8s_openapi::{
        api::{
            core::v1::{Event, Pod, Service},
            networking::v1::Ingress,
        },
        apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::Time},
    },
    kube::ResourceExt,
    memory::{BinaryMultiple, MemoryQuantity},
};
use strum::Display;

use super::{
    block::{self, Block},
    cert_manager::cert_manager_requests,
    certificate,
    namespace_of,
    route::{self, Route},
    GetInstanceError, InstanceManager,
};
use crate::{
    crd::{AutoscaleSpec, Bind, CertManager, Nginx, NginxPort, RpaasInstance},
    error::{ErrorKind, ManagerError},
    external_crd::metrics::PodMetrics,
    gateway::{self, Gateway, Selector},
    tls::CertificateInfo,
};

/// Waiting reasons that mark a pod as errored
const ERROR_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerError",
    "CreateContainerConfigError",
    "RunContainerError",
];

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("failed to read blocks"))]
    Blocks { source: block::Error },

    #[snafu(display("failed to read routes"))]
    Routes { source: route::Error },

    #[snafu(display("failed to read certificates"))]
    Certificates { source: certificate::Error },

    #[snafu(display("failed to load nginx of instance {instance:?}"))]
    GetNginx {
        source: gateway::Error,
        instance: String,
    },

    #[snafu(display("failed to load service {name:?}"))]
    GetService {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to load ingress {name:?}"))]
    GetIngress {
        source: gateway::Error,
        name: String,
    },

    #[snafu(display("failed to list pods"))]
    ListPods { source: gateway::Error },

    #[snafu(display("failed to list events of {kind} {name:?}"))]
    ListEvents {
        source: gateway::Error,
        kind: &'static str,
        name: String,
    },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::GetInstance { source } => source.kind(),
            Error::Blocks { source } => source.kind(),
            Error::Routes { source } => source.kind(),
            Error::Certificates { source } => source.kind(),
            Error::GetNginx { source, .. }
            | Error::GetService { source, .. }
            | Error::GetIngress { source, .. }
            | Error::ListPods { source }
            | Error::ListEvents { source, .. } => source.kind(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AddressType {
    External,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceAddress {
    #[serde(rename = "type")]
    pub type_: AddressType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// `ready`, or `pending` optionally followed by the latest warning
    pub status: String,
}

/// Distinct warning reported for a pod
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodError {
    pub message: String,
    pub first: Option<Time>,
    pub last: Option<Time>,
    pub count: i32,
}

/// Resource usage summed across containers
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PodUsage {
    pub cpu: String,
    pub memory: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    pub ip: Option<String>,
    #[serde(rename = "hostIP")]
    pub host_ip: Option<String>,
    pub created_at: Option<Time>,
    /// Pod phase, or `Errored` when a container is stuck waiting on a failure
    pub status: String,
    pub ready: bool,
    pub restarts: i32,
    pub ports: Vec<NginxPort>,
    pub errors: Vec<PodError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PodUsage>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub name: String,
    pub service: String,
    pub description: Option<String>,
    pub team: Option<String>,
    pub tags: Vec<String>,
    pub plan: String,
    pub flavors: Vec<String>,
    pub replicas: Option<i32>,
    pub autoscale: Option<AutoscaleSpec>,
    pub binds: Vec<Bind>,
    pub routes: Vec<Route>,
    pub blocks: Vec<Block>,
    pub addresses: Vec<InstanceAddress>,
    pub pods: Vec<PodInfo>,
    pub certificates: Vec<CertificateInfo>,
    pub cert_manager_requests: Vec<CertManager>,
    pub dashboard: Option<String>,
}

static DASHBOARD_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*\.(Name|Service)\s*\}\}").expect("dashboard field regex must compile")
});

/// Fills `{{.Name}}` and `{{.Service}}` (with or without inner spaces) into `template`
fn render_dashboard(template: &str, instance: &str, service: &str) -> String {
    DASHBOARD_FIELD
        .replace_all(template, |captures: &Captures| match &captures[1] {
            "Name" => instance,
            _ => service,
        })
        .into_owned()
}

fn pending_status(warning: Option<Event>) -> String {
    match warning.and_then(|event| event.message) {
        Some(message) if !message.is_empty() => format!("pending: {message}"),
        _ => "pending".to_string(),
    }
}

fn external_address(ip: Option<String>, hostname: Option<String>) -> Option<InstanceAddress> {
    (ip.is_some() || hostname.is_some()).then(|| InstanceAddress {
        type_: AddressType::External,
        hostname,
        ip,
        status: "ready".to_string(),
    })
}

fn pending_address(warning: Option<Event>) -> InstanceAddress {
    InstanceAddress {
        type_: AddressType::External,
        hostname: None,
        ip: None,
        status: pending_status(warning),
    }
}

fn latest(events: Vec<Event>) -> Option<Event> {
    events
        .into_iter()
        .max_by_key(|event| event.last_timestamp.clone().or(event.first_timestamp.clone()))
}

/// Groups warning events by message, oldest first
fn pod_errors(events: Vec<Event>) -> Vec<PodError> {
    let mut errors: Vec<PodError> = Vec::new();
    for event in events {
        let message = event.message.unwrap_or_default();
        let first = event.first_timestamp.or(event.last_timestamp.clone());
        let last = event.last_timestamp.or(first.clone());
        let count = event.count.unwrap_or(1).max(1);
        match errors.iter_mut().find(|error| error.message == message) {
            Some(error) => {
                error.first = match (error.first.take(), first) {
                    (Some(current), Some(first)) => Some(current.min(first)),
                    (current, first) => current.or(first),
                };
                error.last = error.last.take().max(last);
                error.count += count;
            }
            None => errors.push(PodError {
                message,
                first,
                last,
                count,
            }),
        }
    }
    errors.sort_by(|a, b| a.first.cmp(&b.first));
    errors
}

fn pod_status(pod: &Pod) -> (String, bool, i32) {
    let status = pod.status.clone().unwrap_or_default();
    let containers = status.container_statuses.unwrap_or_default();
    let ready = !containers.is_empty() && containers.iter().all(|container| container.ready);
    let restarts = containers
        .iter()
        .map(|container| container.restart_count)
        .sum();
    let errored = containers.iter().any(|container| {
        container
            .state
            .as_ref()
            .and_then(|state| state.waiting.as_ref())
            .and_then(|waiting| waiting.reason.as_deref())
            .is_some_and(|reason| ERROR_REASONS.contains(&reason))
    });
    let phase = if errored {
        "Errored".to_string()
    } else {
        status.phase.unwrap_or_else(|| "Unknown".to_string())
    };
    (phase, ready, restarts)
}

/// Millicores of a CPU quantity. metrics-server reports nanocores, which are truncated.
fn milli_cpus(quantity: &Quantity) -> Option<usize> {
    match quantity.0.strip_suffix('n') {
        Some(nanos) => nanos.parse::<usize>().ok().map(|nanos| nanos / 1_000_000),
        None => CpuQuantity::try_from(quantity)
            .ok()
            .map(|cpu| cpu.as_milli_cpus()),
    }
}

fn mebibytes(quantity: &Quantity) -> Option<f32> {
    MemoryQuantity::try_from(quantity)
        .ok()
        .map(|memory| memory.scale_to(BinaryMultiple::Mebi).value)
}

fn container_usage<'a>(
    metrics: &'a PodMetrics,
    resource: &'a str,
) -> impl Iterator<Item = &'a Quantity> + 'a {
    metrics
        .containers
        .iter()
        .filter_map(move |container| container.usage.get(resource))
}

fn pod_usage(metrics: &PodMetrics) -> PodUsage {
    let cpu = container_usage(metrics, "cpu")
        .filter_map(milli_cpus)
        .sum::<usize>();
    let memory = container_usage(metrics, "memory")
        .filter_map(mebibytes)
        .sum::<f32>();
    PodUsage {
        cpu: format!("{cpu}m"),
        memory: format!("{}Mi", memory.round() as i64),
    }
}

impl<G: Gateway> InstanceManager<G> {
    pub async fn get_instance_info(&self, name: &str) -> Result<InstanceInfo, Error> {
        let opts = self.options();
        let instance = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        let blocks = self
            .resolve_blocks(&instance)
            .await
            .context(error::BlocksSnafu)?;
        let routes = self
            .resolve_routes(&instance)
            .await
            .context(error::RoutesSnafu)?;
        let certificates = self
            .certificate_infos(&instance)
            .await
            .context(error::CertificatesSnafu)?;
        let nginx = self.nginx(&instance).await?;
        let addresses = self.addresses(&instance, nginx.as_ref()).await?;
        let pods = self.pods(&instance, nginx.as_ref()).await?;

        let instance_name = instance.name_any();
        let service = instance
            .service_name()
            .unwrap_or(opts.service_name.as_str())
            .to_string();
        let dashboard = opts
            .dashboard_template
            .as_deref()
            .map(|template| render_dashboard(template, &instance_name, &service));
        Ok(InstanceInfo {
            description: instance.description().map(str::to_string),
            team: instance.team().map(str::to_string),
            tags: instance.tags(),
            cert_manager_requests: cert_manager_requests(&instance),
            name: instance_name,
            service,
            plan: instance.spec.plan_name,
            flavors: instance.spec.flavors,
            replicas: instance.spec.replicas,
            autoscale: instance.spec.autoscale,
            binds: instance.spec.binds,
            routes,
            blocks,
            addresses,
            pods,
            certificates,
            dashboard,
        })
    }

    /// External addresses followed by internal ones
    pub async fn get_instance_address(&self, name: &str) -> Result<Vec<InstanceAddress>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let nginx = self.nginx(&instance).await?;
        self.addresses(&instance, nginx.as_ref()).await
    }

    pub async fn get_instance_status(&self, name: &str) -> Result<Vec<PodInfo>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let nginx = self.nginx(&instance).await?;
        self.pods(&instance, nginx.as_ref()).await
    }

    pub(super) async fn nginx(&self, instance: &RpaasInstance) -> Result<Option<Nginx>, Error> {
        let instance_name = instance.name_any();
        let nginx = self
            .client
            .get_opt::<Nginx>(&namespace_of(instance), &instance_name)
            .await
            .context(error::GetNginxSnafu {
                instance: &instance_name,
            })?;
        if nginx.is_none() {
            tracing::debug!(instance = %instance_name, "nginx not created yet");
        }
        Ok(nginx)
    }

    /// Pods matched by the selector the nginx operator reports, sorted by name
    pub(super) async fn nginx_pods(
        &self,
        instance: &RpaasInstance,
        nginx: &Nginx,
    ) -> Result<Vec<Pod>, Error> {
        let Some(selector) = nginx
            .status
            .as_ref()
            .and_then(|status| status.pod_selector.as_deref())
        else {
            return Ok(Vec::new());
        };
        let mut pods = self
            .client
            .list::<Pod>(
                Some(&namespace_of(instance)),
                &Selector::from_query(selector),
            )
            .await
            .context(error::ListPodsSnafu)?;
        pods.sort_by_key(|pod| pod.name_any());
        Ok(pods)
    }

    async fn warning_events(
        &self,
        namespace: &str,
        kind: &'static str,
        name: &str,
    ) -> Result<Vec<Event>, Error> {
        let selector = Selector::default()
            .field("involvedObject.kind", kind)
            .field("involvedObject.name", name)
            .field("type", "Warning");
        self.uncached_client
            .list::<Event>(Some(namespace), &selector)
            .await
            .context(error::ListEventsSnafu { kind, name })
    }

    async fn addresses(
        &self,
        instance: &RpaasInstance,
        nginx: Option<&Nginx>,
    ) -> Result<Vec<InstanceAddress>, Error> {
        let Some(status) = nginx.and_then(|nginx| nginx.status.as_ref()) else {
            return Ok(Vec::new());
        };
        let namespace = namespace_of(instance);
        let mut external = Vec::new();
        let mut internal = Vec::new();

        for service_name in status.services.iter().map(|service| &service.name) {
            let Some(service) = self
                .client
                .get_opt::<Service>(&namespace, service_name)
                .await
                .context(error::GetServiceSnafu { name: service_name })?
            else {
                continue;
            };
            let spec = service.spec.unwrap_or_default();
            if let Some(cluster_ip) = spec.cluster_ip.filter(|ip| !ip.is_empty() && ip != "None") {
                internal.push(InstanceAddress {
                    type_: AddressType::Internal,
                    hostname: Some(format!("{service_name}.{namespace}.svc.cluster.local")),
                    ip: Some(cluster_ip),
                    status: "ready".to_string(),
                });
            }
            if spec.type_.as_deref() != Some("LoadBalancer") {
                continue;
            }
            let ready = service
                .status
                .and_then(|status| status.load_balancer)
                .and_then(|load_balancer| load_balancer.ingress)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|ingress| external_address(ingress.ip, ingress.hostname))
                .collect::<Vec<_>>();
            if ready.is_empty() {
                let events = self
                    .warning_events(&namespace, "Service", service_name)
                    .await?;
                external.push(pending_address(latest(events)));
            } else {
                external.extend(ready);
            }
        }

        for ingress_name in status.ingresses.iter().map(|ingress| &ingress.name) {
            let Some(ingress) = self
                .client
                .get_opt::<Ingress>(&namespace, ingress_name)
                .await
                .context(error::GetIngressSnafu { name: ingress_name })?
            else {
                continue;
            };
            let ready = ingress
                .status
                .and_then(|status| status.load_balancer)
                .and_then(|load_balancer| load_balancer.ingress)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|ingress| external_address(ingress.ip, ingress.hostname))
                .collect::<Vec<_>>();
            if ready.is_empty() {
                let events = self
                    .warning_events(&namespace, "Ingress", ingress_name)
                    .await?;
                external.push(pending_address(latest(events)));
            } else {
                external.extend(ready);
            }
        }

        external.extend(internal);
        Ok(external)
    }

    async fn pods(
        &self,
        instance: &RpaasInstance,
        nginx: Option<&Nginx>,
    ) -> Result<Vec<PodInfo>, Error> {
        let Some(nginx) = nginx else {
            return Ok(Vec::new());
        };
        let namespace = namespace_of(instance);
        let pods = self.nginx_pods(instance, nginx).await?;

        let mut infos = Vec::with_capacity(pods.len());
        for pod in pods {
            let pod_name = pod.name_any();
            let (status, ready, restarts) = pod_status(&pod);
            let events = self.warning_events(&namespace, "Pod", &pod_name).await?;
            let metrics = match self
                .client
                .get_opt::<PodMetrics>(&namespace, &pod_name)
                .await
            {
                Ok(metrics) => metrics.as_ref().map(pod_usage),
                Err(err) => {
                    tracing::warn!(
                        pod = %pod_name,
                        error = &err as &dyn std::error::Error,
                        "failed to read pod metrics"
                    );
                    None
                }
            };
            let pod_state = pod.status.unwrap_or_default();
            infos.push(PodInfo {
                name: pod_name,
                ip: pod_state.pod_ip,
                host_ip: pod_state.host_ip,
                created_at: pod.metadata.creation_timestamp,
                status,
                ready,
                restarts,
                ports: nginx.spec.pod_template.ports.clone(),
                errors: pod_errors(events),
                metrics,
            });
        }
        Ok(infos)
    }
}
