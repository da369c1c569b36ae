//! In-memory [`Gateway`] used by the unit tests
//!
//! Objects are stored as JSON, keyed by kind, namespace and name. Writes honour resource
//! versions, `generateName`, AlreadyExists, and deletes cascade to owned objects. Patches are
//! applied with `json_patch` as the API server would apply them.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use serde_json::Value as Json;
use snafu::ResultExt;
use stackable_operator::{
    k8s_openapi::api::core::v1::Pod,
    kube::{self, core::ErrorResponse},
};
use tokio::sync::mpsc;

use super::{
    object_ref, object_ref_of, versioned_patch, ClusterObject, CreateSnafu, DeleteSnafu,
    Error, Gateway, GetSnafu, LogOptions, PatchSnafu, ScopedApi, Selector,
    SerializeSnafu, StreamLogsSnafu, UpdateSnafu,
};

type Key = (String, String, String);

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Json>,
    logs: BTreeMap<Key, Vec<String>>,
    resource_version: u64,
    generated: u64,
}

/// Clones share the same state, like two clients of one cluster
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<State>>,
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn kind_key<K: ClusterObject>() -> String {
    format!("{}/{}", K::api_version(&()), K::kind(&()))
}

fn key<K: ClusterObject>(namespace: &str, name: &str) -> Key {
    let namespace = if <K::Scope as ScopedApi>::NAMESPACED {
        namespace
    } else {
        ""
    };
    (kind_key::<K>(), namespace.to_string(), name.to_string())
}

fn lookup<'a>(value: &'a Json, path: &str) -> Option<&'a Json> {
    path.split('.').try_fold(value, |value, segment| value.get(segment))
}

fn matches(value: &Json, selector: &Selector) -> bool {
    let labels = value.pointer("/metadata/labels");
    selector.labels.iter().all(|(key, expected)| {
        labels
            .and_then(|labels| labels.get(key))
            .and_then(Json::as_str)
            == Some(expected.as_str())
    }) && selector
        .fields
        .iter()
        .all(|(path, expected)| lookup(value, path).and_then(Json::as_str) == Some(expected.as_str()))
}

fn metadata_mut(value: &mut Json) -> &mut serde_json::Map<String, Json> {
    if !value["metadata"].is_object() {
        value["metadata"] = Json::Object(Default::default());
    }
    match &mut value["metadata"] {
        Json::Object(metadata) => metadata,
        _ => unreachable!("metadata was just set to an object"),
    }
}

fn from_json<K: ClusterObject>(value: &Json) -> K {
    serde_json::from_value(value.clone()).expect("stored objects must deserialize")
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("fake gateway state poisoned")
    }

    /// Stores `obj` as if it had been created by someone else
    pub fn insert<K: ClusterObject>(&self, obj: K) -> K {
        self.create_sync(&obj)
            .unwrap_or_else(|err| panic!("failed to seed {obj:?}: {err}"))
    }

    /// Current state of an object, bypassing error handling
    pub fn object<K: ClusterObject>(&self, namespace: &str, name: &str) -> Option<K> {
        self.state()
            .objects
            .get(&key::<K>(namespace, name))
            .map(from_json)
    }

    /// Every object of kind `K` in `namespace`
    pub fn objects<K: ClusterObject>(&self, namespace: &str) -> Vec<K> {
        self.list_sync(Some(namespace), &Selector::default())
    }

    /// Log lines returned for `container` (or every container) of `pod`
    pub fn set_logs(&self, namespace: &str, pod: &str, container: &str, lines: &[&str]) {
        self.state().logs.insert(
            (namespace.to_string(), pod.to_string(), container.to_string()),
            lines.iter().map(|line| line.to_string()).collect(),
        );
    }

    fn list_sync<K: ClusterObject>(&self, namespace: Option<&str>, selector: &Selector) -> Vec<K> {
        let kind = kind_key::<K>();
        self.state()
            .objects
            .iter()
            .filter(|((k, ns, _), value)| {
                *k == kind && namespace.map_or(true, |namespace| ns == namespace) && matches(value, selector)
            })
            .map(|(_, value)| from_json(value))
            .collect()
    }

    fn next_version(state: &mut State) -> String {
        state.resource_version += 1;
        state.resource_version.to_string()
    }

    fn create_sync<K: ClusterObject>(&self, obj: &K) -> Result<K, Error> {
        let object = object_ref_of(obj);
        let mut value = serde_json::to_value(obj).context(SerializeSnafu {
            object: object.clone(),
        })?;
        let mut state = self.state();
        let meta = obj.meta();
        let name = match (&meta.name, &meta.generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => {
                state.generated += 1;
                format!("{prefix}{:05x}", state.generated)
            }
            _ => {
                return Err(api_error(400, "Invalid", "name or generateName is required".into()))
                    .context(CreateSnafu { object });
            }
        };
        let key = key::<K>(meta.namespace.as_deref().unwrap_or_default(), &name);
        if state.objects.contains_key(&key) {
            return Err(api_error(409, "AlreadyExists", format!("{name} already exists")))
                .context(CreateSnafu { object });
        }
        let resource_version = Self::next_version(&mut state);
        let metadata = metadata_mut(&mut value);
        metadata.insert("name".to_string(), Json::String(name));
        metadata.insert("uid".to_string(), Json::String(format!("uid-{resource_version}")));
        metadata.insert("resourceVersion".to_string(), Json::String(resource_version));
        let created = from_json(&value);
        state.objects.insert(key, value);
        Ok(created)
    }

    fn delete_owned(state: &mut State, uid: &str) {
        let owned = state
            .objects
            .iter()
            .filter(|(_, value)| {
                value
                    .pointer("/metadata/ownerReferences")
                    .and_then(Json::as_array)
                    .is_some_and(|owners| owners.iter().any(|owner| owner["uid"] == uid))
            })
            .map(|(key, value)| (key.clone(), value.pointer("/metadata/uid").cloned()))
            .collect::<Vec<_>>();
        for (key, uid) in owned {
            state.objects.remove(&key);
            if let Some(Json::String(uid)) = uid {
                Self::delete_owned(state, &uid);
            }
        }
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn get<K: ClusterObject>(&self, namespace: &str, name: &str) -> Result<K, Error> {
        self.object(namespace, name)
            .ok_or_else(|| api_error(404, "NotFound", format!("{name} not found")))
            .context(GetSnafu {
                object: object_ref::<K>(namespace, name),
            })
    }

    async fn list<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        selector: &Selector,
    ) -> Result<Vec<K>, Error> {
        Ok(self.list_sync(namespace, selector))
    }

    async fn create<K: ClusterObject>(&self, obj: &K) -> Result<K, Error> {
        self.create_sync(obj)
    }

    async fn update<K: ClusterObject>(&self, obj: &K) -> Result<K, Error> {
        let object = object_ref_of(obj);
        let meta = obj.meta();
        let name = meta.name.clone().unwrap_or_default();
        let key = key::<K>(meta.namespace.as_deref().unwrap_or_default(), &name);
        let mut value = serde_json::to_value(obj).context(SerializeSnafu {
            object: object.clone(),
        })?;
        let mut state = self.state();
        let Some(stored) = state.objects.get(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")))
                .context(UpdateSnafu { object });
        };
        let stored_version = stored.pointer("/metadata/resourceVersion").cloned();
        let stored_uid = stored.pointer("/metadata/uid").cloned();
        if let Some(version) = &meta.resource_version {
            if stored_version.as_ref().and_then(Json::as_str) != Some(version.as_str()) {
                return Err(api_error(409, "Conflict", format!("{name} was modified")))
                    .context(UpdateSnafu { object });
            }
        }
        let resource_version = Self::next_version(&mut state);
        let metadata = metadata_mut(&mut value);
        metadata.insert("resourceVersion".to_string(), Json::String(resource_version));
        if let Some(uid) = stored_uid {
            metadata.insert("uid".to_string(), uid);
        }
        let updated = from_json(&value);
        state.objects.insert(key, value);
        Ok(updated)
    }

    async fn patch<K: ClusterObject>(&self, original: &K, target: &K) -> Result<K, Error> {
        let object = object_ref_of(original);
        let patch = versioned_patch(original, target).context(SerializeSnafu {
            object: object.clone(),
        })?;
        let meta = original.meta();
        let name = meta.name.clone().unwrap_or_default();
        let key = key::<K>(meta.namespace.as_deref().unwrap_or_default(), &name);
        let mut state = self.state();
        let resource_version = Self::next_version(&mut state);
        let Some(stored) = state.objects.get_mut(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")))
                .context(PatchSnafu { object });
        };
        let mut patched = stored.clone();
        if let Err(err) = json_patch::patch(&mut patched, &patch.0) {
            return Err(api_error(422, "Invalid", format!("{name}: {err}")))
                .context(PatchSnafu { object });
        }
        metadata_mut(&mut patched).insert("resourceVersion".to_string(), Json::String(resource_version));
        *stored = patched;
        Ok(from_json(stored))
    }

    async fn delete<K: ClusterObject>(&self, obj: &K) -> Result<(), Error> {
        let object = object_ref_of(obj);
        let meta = obj.meta();
        let name = meta.name.clone().unwrap_or_default();
        let key = key::<K>(meta.namespace.as_deref().unwrap_or_default(), &name);
        let mut state = self.state();
        let Some(removed) = state.objects.remove(&key) else {
            return Err(api_error(404, "NotFound", format!("{name} not found")))
                .context(DeleteSnafu { object });
        };
        if let Some(Json::String(uid)) = removed.pointer("/metadata/uid") {
            Self::delete_owned(&mut state, uid);
        }
        Ok(())
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        opts: &LogOptions,
        lines: mpsc::Sender<String>,
    ) -> Result<(), Error> {
        let found = {
            let state = self.state();
            if !state.objects.contains_key(&key::<Pod>(namespace, pod)) {
                None
            } else {
                Some(
                    state
                        .logs
                        .iter()
                        .filter(|((ns, name, container), _)| {
                            ns == namespace
                                && name == pod
                                && opts.container.as_ref().map_or(true, |c| c == container)
                        })
                        .flat_map(|(_, lines)| lines.clone())
                        .collect::<Vec<_>>(),
                )
            }
        };
        let mut found = found
            .ok_or_else(|| api_error(404, "NotFound", format!("pod {pod} not found")))
            .context(StreamLogsSnafu {
                object: object_ref::<Pod>(namespace, pod),
            })?;
        if let Some(tail) = opts.tail_lines {
            let skip = found.len().saturating_sub(tail.max(0) as usize);
            found.drain(..skip);
        }
        for line in found {
            if lines.send(line).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use stackable_operator::k8s_openapi::{
        api::core::v1::{ConfigMap, Namespace},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    };

    use super::FakeGateway;
    use crate::{
        error::{ErrorKind, ManagerError},
        gateway::{Gateway, Selector},
    };

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn optimistic_concurrency() {
        let gateway = FakeGateway::new();
        let original = gateway.insert(config_map("cm", &[]));
        let mut target = original.clone();
        target.data = Some(BTreeMap::from([("a".to_string(), "1".to_string())]));
        let patched = gateway.patch(&original, &target).await.unwrap();
        assert_ne!(patched.metadata.resource_version, original.metadata.resource_version);

        let err = gateway.patch(&original, &target).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.kind(), ErrorKind::Conflict);
        let err = gateway.update(&original).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(gateway.update(&patched).await.is_ok());
    }

    #[tokio::test]
    async fn create_and_select() {
        let gateway = FakeGateway::new();
        gateway.insert(config_map("a", &[("app", "x")]));
        let err = gateway.create(&config_map("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());

        let mut generated = config_map("", &[("app", "y")]);
        generated.metadata.name = None;
        generated.metadata.generate_name = Some("files-".to_string());
        let created = gateway.create(&generated).await.unwrap();
        assert!(created.metadata.name.unwrap().starts_with("files-"));

        let selected: Vec<ConfigMap> = gateway
            .list(Some("default"), &Selector::from_query("app=y"))
            .await
            .unwrap();
        assert_eq!(selected.len(), 1);
        let by_field: Vec<ConfigMap> = gateway
            .list(None, &Selector::default().field("metadata.name", "a"))
            .await
            .unwrap();
        assert_eq!(by_field.len(), 1);
        assert!(gateway
            .get::<Namespace>("", "missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn deletes_cascade_to_owned_objects() {
        let gateway = FakeGateway::new();
        let owner = gateway.insert(config_map("owner", &[]));
        let mut child = config_map("child", &[]);
        child.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            name: "owner".to_string(),
            uid: owner.metadata.uid.clone().unwrap(),
            ..Default::default()
        }]);
        gateway.insert(child);
        gateway.delete(&owner).await.unwrap();
        assert!(gateway.objects::<ConfigMap>("default").is_empty());
    }
}
