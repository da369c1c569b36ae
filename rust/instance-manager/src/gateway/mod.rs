//! Typed read/write access to the cluster API
//!
//! Every kind the manager touches is a [`ClusterObject`], and every call goes through the
//! [`Gateway`] trait so that the mutators can be exercised against an in-memory cluster.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use futures::{AsyncBufReadExt as _, StreamExt as _};
use json_patch::{PatchOperation, TestOperation};
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Pod, ClusterResourceScope, NamespaceResourceScope},
    kube::{
        self,
        api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, Patch, PatchParams, PostParams},
        runtime::reflector::ObjectRef,
        Resource,
    },
};
use tokio::sync::mpsc;

use crate::error::{ErrorKind, ManagerError};

#[cfg(test)]
pub mod fake;
pub mod value;

/// Builds an [`Api`] for resources of one scope
pub trait ScopedApi {
    const NAMESPACED: bool;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>;
}

impl ScopedApi for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn api<K>(client: kube::Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }
}

impl ScopedApi for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn api<K>(client: kube::Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        Api::all(client)
    }
}

/// A statically typed kind the gateway can read and write
pub trait ClusterObject:
    Resource<DynamicType = (), Scope: ScopedApi>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = (), Scope: ScopedApi>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Reference used in error messages
pub fn object_ref<K: ClusterObject>(namespace: &str, name: &str) -> ObjectRef<DynamicObject> {
    let obj_ref = ObjectRef::<K>::new(name);
    if <K::Scope as ScopedApi>::NAMESPACED {
        obj_ref.within(namespace).erase()
    } else {
        obj_ref.erase()
    }
}

fn object_ref_of<K: ClusterObject>(obj: &K) -> ObjectRef<DynamicObject> {
    let meta = obj.meta();
    object_ref::<K>(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name
            .as_deref()
            .or(meta.generate_name.as_deref())
            .unwrap_or_default(),
    )
}

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {object}"))]
    Get {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to list {kind} objects in {namespace:?}"))]
    List {
        source: kube::Error,
        kind: String,
        namespace: Option<String>,
    },

    #[snafu(display("failed to create {object}"))]
    Create {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to update {object}"))]
    Update {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to patch {object}"))]
    Patch {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to delete {object}"))]
    Delete {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to serialize {object}"))]
    Serialize {
        source: serde_json::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to stream logs of {object}"))]
    StreamLogs {
        source: kube::Error,
        object: ObjectRef<DynamicObject>,
    },

    #[snafu(display("failed to read logs of {object}"))]
    ReadLogs {
        source: std::io::Error,
        object: ObjectRef<DynamicObject>,
    },
}

impl Error {
    fn api_response(&self) -> Option<&kube::core::ErrorResponse> {
        match self {
            Error::Get { source, .. }
            | Error::List { source, .. }
            | Error::Create { source, .. }
            | Error::Update { source, .. }
            | Error::Patch { source, .. }
            | Error::Delete { source, .. }
            | Error::StreamLogs { source, .. } => match source {
                kube::Error::Api(response) => Some(response),
                _ => None,
            },
            Error::Serialize { .. } | Error::ReadLogs { .. } => None,
        }
    }

    pub fn code(&self) -> Option<u16> {
        self.api_response().map(|response| response.code)
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(404)
    }

    /// Stale resource version or a concurrent create.
    /// A patch whose resource version test fails is rejected as unprocessable.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Patch { .. } => matches!(self.code(), Some(409 | 422)),
            _ => self.code() == Some(409),
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.api_response()
            .is_some_and(|response| response.code == 409 && response.reason == "AlreadyExists")
    }
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        if self.is_conflict() {
            return ErrorKind::Conflict;
        }
        match self.code() {
            Some(400) => ErrorKind::Validation,
            Some(404) => ErrorKind::NotFound,
            Some(409) => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }
}

/// Equality-based label and field selector
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    pub labels: BTreeMap<String, String>,
    pub fields: BTreeMap<String, String>,
}

impl Selector {
    pub fn labels(labels: BTreeMap<String, String>) -> Self {
        Self {
            labels,
            ..Self::default()
        }
    }

    pub fn field(mut self, key: &str, value: &str) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    /// Parses a query-string selector such as `app=nginx,nginx.tsuru.io/resource-name=foo`.
    /// Terms that are not equality matches are ignored.
    pub fn from_query(query: &str) -> Self {
        let labels = query
            .split(',')
            .filter_map(|term| {
                let (key, value) = term.split_once("==").or_else(|| term.split_once('='))?;
                (!key.trim().ends_with('!'))
                    .then(|| (key.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self::labels(labels)
    }

    fn query(terms: &BTreeMap<String, String>) -> Option<String> {
        (!terms.is_empty()).then(|| {
            terms
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",")
        })
    }

    pub fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = Self::query(&self.labels) {
            params = params.labels(&labels);
        }
        if let Some(fields) = Self::query(&self.fields) {
            params = params.fields(&fields);
        }
        params
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub container: Option<String>,
    pub follow: bool,
    pub tail_lines: Option<i64>,
    pub since_seconds: Option<i64>,
    pub timestamps: bool,
}

/// Typed cluster access. Implementations must be safe for concurrent use.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Cluster-scoped kinds ignore `namespace`
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, Error>;

    /// `namespace` of [`None`] lists across all namespaces
    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, Error>;

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K, Error>;

    /// Replaces `obj`, failing if its resource version is stale
    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K, Error>;

    /// Applies the difference between `original` and `target`, failing if `original` is stale
    async fn patch<K: ClusterObject>(&self, original: &K, target: &K) -> Result<K, Error>;

    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<(), Error>;

    /// Sends each log line of `pod` to `lines` until the log ends or the receiver is dropped
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        opts: &LogOptions,
        lines: mpsc::Sender<String>,
    ) -> Result<(), Error>;

    async fn get_opt<K: ClusterObject>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<K>, Error> {
        match self.get::<K>(namespace, name).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// JSON patch from `original` to `target`, led by a `test` of the original's resource version
pub fn versioned_patch<K: ClusterObject>(
    original: &K,
    target: &K,
) -> Result<json_patch::Patch, serde_json::Error> {
    let mut patch = json_patch::diff(&serde_json::to_value(original)?, &serde_json::to_value(target)?);
    if let Some(resource_version) = &original.meta().resource_version {
        patch.0.insert(
            0,
            PatchOperation::Test(TestOperation {
                path: "/metadata/resourceVersion".to_string(),
                value: serde_json::Value::String(resource_version.clone()),
            }),
        );
    }
    Ok(patch)
}

/// [`Gateway`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeGateway {
    client: kube::Client,
}

impl KubeGateway {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api<K: ClusterObject>(&self, namespace: Option<&str>) -> Api<K> {
        <K::Scope as ScopedApi>::api(self.client.clone(), namespace)
    }

    fn api_for<K: ClusterObject>(&self, obj: &K) -> Api<K> {
        self.api(obj.meta().namespace.as_deref())
    }
}

impl Debug for KubeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KubeGateway")
    }
}

#[async_trait]
impl Gateway for KubeGateway {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.api::<K>(Some(namespace))
            .get(name)
            .await
            .with_context(|_| GetSnafu {
                object: object_ref::<K>(namespace, name),
            })
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        Ok(self
            .api::<K>(namespace)
            .list(&selector.list_params())
            .await
            .with_context(|_| ListSnafu {
                kind: K::kind(&()).to_string(),
                namespace: namespace.map(str::to_string),
            })?
            .items)
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K, Error> {
        self.api_for(obj)
            .create(&PostParams::default(), obj)
            .await
            .with_context(|_| CreateSnafu {
                object: object_ref_of(obj),
            })
    }

    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K, Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api_for(obj)
            .replace(&name, &PostParams::default(), obj)
            .await
            .with_context(|_| UpdateSnafu {
                object: object_ref_of(obj),
            })
    }

    async fn patch<K: ClusterObject>(&self, original: &K, target: &K) -> Result<K, Error> {
        let patch = versioned_patch(original, target).with_context(|_| SerializeSnafu {
            object: object_ref_of(original),
        })?;
        let name = original.meta().name.clone().unwrap_or_default();
        self.api_for(original)
            .patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
            .await
            .with_context(|_| PatchSnafu {
                object: object_ref_of(original),
            })
    }

    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<(), Error> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.api_for(obj)
            .delete(&name, &DeleteParams::default())
            .await
            .with_context(|_| DeleteSnafu {
                object: object_ref_of(obj),
            })?;
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        opts: &LogOptions,
        lines: mpsc::Sender<String>,
    ) -> Result<(), Error> {
        let object = || object_ref::<Pod>(namespace, pod);
        let params = LogParams {
            container: opts.container.clone(),
            follow: opts.follow,
            tail_lines: opts.tail_lines,
            since_seconds: opts.since_seconds,
            timestamps: opts.timestamps,
            ..LogParams::default()
        };
        let reader = Api::<Pod>::namespaced(self.client.clone(), namespace)
            .log_stream(pod, &params)
            .await
            .with_context(|_| StreamLogsSnafu { object: object() })?;
        let mut log_lines = std::pin::pin!(reader.lines());
        while let Some(line) = log_lines.next().await {
            let line = line.with_context(|_| ReadLogsSnafu { object: object() })?;
            if lines.send(line).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}
