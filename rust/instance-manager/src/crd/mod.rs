//! Custom resources owned by the RPaaS service and the nginx operator it drives

mod instance;
mod nginx;
mod plan;

pub use instance::{
    AllowedUpstream, AutoscaleSpec, Bind, BlockType, CertManager, ConfigMapKeyRef,
    DynamicCertificates, LoadBalance, Location, PodTemplateSpec, RpaasInstance,
    RpaasInstanceSpec, ServiceSpec, TlsSecret, TlsSecretItem, TrafficShapingPolicy,
    UpstreamOptions, Value,
};
pub use nginx::{Nginx, NginxPodTemplate, NginxPort, NginxSpec, NginxStatus, ObjectName};
pub use plan::{PlanConfig, RpaasFlavor, RpaasFlavorSpec, RpaasPlan, RpaasPlanSpec};
