//! Path-scoped proxy destinations and configuration snippets

use serde::Serialize;
use snafu::{OptionExt, ResultExt, Snafu};

use super::{namespace_of, GetInstanceError, InstanceManager};
use crate::{
    crd::{Location, RpaasInstance},
    error::{ErrorKind, ManagerError},
    gateway::{self, value, Gateway},
    validation,
};

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("invalid route"))]
    Validation { source: validation::Error },

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("route {path:?} not found"))]
    NotFound { path: String },

    #[snafu(display("failed to read content of route {path:?}"))]
    ResolveValue { source: value::Error, path: String },

    #[snafu(display("failed to update rpaas instance"))]
    PatchInstance { source: gateway::Error },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::GetInstance { source } => source.kind(),
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::ResolveValue { source, .. } => source.kind(),
            Error::PatchInstance { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    pub https_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl<G: Gateway> InstanceManager<G> {
    /// Replaces the route with the same path, or appends a new one
    pub async fn update_route(&self, name: &str, route: Location) -> Result<(), Error> {
        let opts = self.options();
        validation::route(&route, &opts.config_deny_patterns).context(error::ValidationSnafu)?;

        let original = self
            .find_instance(&opts, name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        match target
            .spec
            .locations
            .iter_mut()
            .find(|location| location.path == route.path)
        {
            Some(location) => *location = route,
            None => target.spec.locations.push(route),
        }
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    pub async fn delete_route(&self, name: &str, path: &str) -> Result<(), Error> {
        let original = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let mut target = original.clone();
        let index = target
            .spec
            .locations
            .iter()
            .position(|location| location.path == path)
            .context(error::NotFoundSnafu { path })?;
        target.spec.locations.remove(index);
        self.patch_instance(&original, &target)
            .await
            .context(error::PatchInstanceSnafu)?;
        Ok(())
    }

    /// Routes in declaration order, leaving out those with neither destination nor content
    pub async fn get_routes(&self, name: &str) -> Result<Vec<Route>, Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        self.resolve_routes(&instance).await
    }

    pub(super) async fn resolve_routes(
        &self,
        instance: &RpaasInstance,
    ) -> Result<Vec<Route>, Error> {
        let namespace = namespace_of(instance);
        let mut routes = Vec::with_capacity(instance.spec.locations.len());
        for location in instance.spec.locations.iter().cloned() {
            let content = match &location.content {
                Some(content) => value::resolve(&self.client, &namespace, content)
                    .await
                    .context(error::ResolveValueSnafu {
                        path: &location.path,
                    })?
                    .filter(|content| !content.is_empty()),
                None => None,
            };
            let destination = location
                .destination
                .filter(|destination| !destination.is_empty());
            if destination.is_none() && content.is_none() {
                continue;
            }
            routes.push(Route {
                path: location.path,
                destination,
                https_only: location.force_https,
                content,
            });
        }
        Ok(routes)
    }
}

#[cfg(test)]
mod tests {
    use super::Route;
    use crate::{
        config::DenyPattern,
        crd::{ConfigMapKeyRef, Location, Value},
        error::{ErrorKind, ManagerError},
        manager::test_util::{config_map, instance, manager, Cluster},
    };

    fn destination(path: &str, destination: &str) -> Location {
        Location {
            path: path.to_string(),
            destination: Some(destination.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn update_replaces_by_path() {
        let cluster = Cluster::new();
        cluster.gateway.insert(instance("r1"));
        let manager = manager(&cluster);

        manager
            .update_route("r1", destination("/app", "app.tsuru.io"))
            .await
            .unwrap();
        manager
            .update_route(
                "r1",
                Location {
                    path: "/static".to_string(),
                    content: Some(Value::Inline("root /srv;".to_string())),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        manager
            .update_route(
                "r1",
                Location {
                    force_https: true,
                    ..destination("/app", "app2.tsuru.io")
                },
            )
            .await
            .unwrap();

        let routes = manager.get_routes("r1").await.unwrap();
        assert_eq!(
            routes,
            [
                Route {
                    path: "/app".to_string(),
                    destination: Some("app2.tsuru.io".to_string()),
                    https_only: true,
                    content: None,
                },
                Route {
                    path: "/static".to_string(),
                    content: Some("root /srv;".to_string()),
                    ..Default::default()
                },
            ]
        );
    }

    #[tokio::test]
    async fn rejects_invalid_routes() {
        let mut cluster = Cluster::new();
        cluster.options.config_deny_patterns =
            vec![DenyPattern::try_from("content_by_lua".to_string()).unwrap()];
        cluster.gateway.insert(instance("r1"));
        let manager = manager(&cluster);

        let both = Location {
            content: Some(Value::Inline("return 200;".to_string())),
            ..destination("/app", "app.tsuru.io")
        };
        let forbidden = Location {
            path: "/lua".to_string(),
            content: Some(Value::Inline("content_by_lua 'x'".to_string())),
            ..Default::default()
        };
        for route in [both, forbidden.clone(), destination("app", "app.tsuru.io")] {
            let err = manager.update_route("r1", route).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation);
        }
        let err = manager.update_route("r1", forbidden).await.unwrap_err();
        assert!(
            crate::error::error_full_message(&err).contains("content_by_lua"),
            "{err}"
        );
        assert!(cluster.instance("r1").spec.locations.is_empty());
    }

    #[tokio::test]
    async fn delete_and_filter_routes() {
        let cluster = Cluster::new();
        let mut existing = instance("r1");
        existing.spec.locations = vec![
            destination("/app", "app.tsuru.io"),
            Location {
                path: "/optional".to_string(),
                content: Some(Value::ConfigMapKeyRef(ConfigMapKeyRef {
                    name: "r1-routes".to_string(),
                    key: "missing".to_string(),
                    optional: true,
                })),
                ..Default::default()
            },
            Location {
                path: "/shared".to_string(),
                content: Some(Value::ConfigMapKeyRef(ConfigMapKeyRef {
                    name: "r1-routes".to_string(),
                    key: "shared".to_string(),
                    optional: false,
                })),
                ..Default::default()
            },
        ];
        cluster.gateway.insert(existing);
        cluster
            .gateway
            .insert(config_map("r1-routes", &[("shared", "return 204;")]));
        let manager = manager(&cluster);

        let paths = |routes: Vec<Route>| routes.into_iter().map(|r| r.path).collect::<Vec<_>>();
        assert_eq!(paths(manager.get_routes("r1").await.unwrap()), ["/app", "/shared"]);

        manager.delete_route("r1", "/app").await.unwrap();
        assert_eq!(paths(manager.get_routes("r1").await.unwrap()), ["/shared"]);
        let err = manager.delete_route("r1", "/app").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
