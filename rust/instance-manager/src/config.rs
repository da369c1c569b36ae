//! Process-wide [`RuntimeOptions`], loaded from YAML and published as immutable snapshots

use std::{
    collections::BTreeMap,
    fmt::Debug,
    ops::Deref,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;
use snafu::{ensure, ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::core::v1::Affinity;
use tokio::sync::watch;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read options from {path:?}"))]
    ReadFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse options from {path:?}"))]
    Parse {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("serviceName must be set"))]
    MissingServiceName,

    #[snafu(display("webSocket.{field} must be greater than zero"))]
    ZeroDuration { field: &'static str },
}

/// Read-only view of the process configuration consumed by the manager
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeOptions {
    /// Name of the service this manager serves; instances live in a namespace named after it
    pub service_name: String,

    /// Place instances in `<serviceName>-<pool>` namespaces instead of a single shared one
    #[serde(default)]
    pub namespaced_instances: bool,

    #[serde(default)]
    pub default_affinity: Option<Affinity>,

    /// Pod affinity to use per team, takes precedence over `defaultAffinity`
    #[serde(default)]
    pub team_affinity: BTreeMap<String, Affinity>,

    #[serde(default)]
    pub default_cert_manager_issuer: Option<String>,

    #[serde(default)]
    pub enable_cert_manager: bool,

    /// Service annotation receiving the `lb-name` parameter
    #[serde(default)]
    pub load_balancer_name_label_key: Option<String>,

    /// Patterns that must not appear in blocks and route contents
    #[serde(default)]
    pub config_deny_patterns: Vec<DenyPattern>,

    /// Dashboard link template, e.g. `https://grafana.example.com/d/rpaas?var-instance={{.Name}}`
    #[serde(default)]
    pub dashboard_template: Option<String>,

    #[serde(default)]
    pub debug_image: Option<String>,

    #[serde(default)]
    pub tls_certificate: Option<PathBuf>,

    #[serde(default)]
    pub tls_key: Option<PathBuf>,

    #[serde(default)]
    pub web_socket: WebSocketOptions,

    #[serde(default)]
    pub api_username: Option<String>,

    #[serde(default)]
    pub api_password: Option<Password>,
}

impl RuntimeOptions {
    pub fn from_yaml_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::from_yaml_str(&raw).map_err(|err| match err {
            Error::Parse { source, .. } => Error::Parse {
                source,
                path: path.to_path_buf(),
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, Error> {
        let opts: Self = serde_yaml::from_str(raw).context(ParseSnafu { path: "<inline>" })?;
        ensure!(!opts.service_name.is_empty(), MissingServiceNameSnafu);
        opts.web_socket.validate()?;
        Ok(opts)
    }

    /// Affinity for new pods of `team`
    pub fn affinity_for_team(&self, team: &str) -> Option<&Affinity> {
        self.team_affinity
            .get(team)
            .or(self.default_affinity.as_ref())
    }
}

/// Timeouts applied to long-running exec, debug and log streams
#[derive(Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketOptions {
    #[serde(default = "WebSocketOptions::default_handshake_timeout", with = "humantime_serde")]
    pub handshake_timeout: Duration,

    #[serde(default = "WebSocketOptions::default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    #[serde(default = "WebSocketOptions::default_ping_interval", with = "humantime_serde")]
    pub ping_interval: Duration,

    #[serde(default = "WebSocketOptions::default_write_timeout", with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl WebSocketOptions {
    fn default_handshake_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn default_read_timeout() -> Duration {
        Duration::from_secs(60)
    }

    fn default_ping_interval() -> Duration {
        Duration::from_secs(2)
    }

    fn default_write_timeout() -> Duration {
        Duration::from_secs(5)
    }

    fn validate(&self) -> Result<(), Error> {
        for (field, duration) in [
            ("handshakeTimeout", self.handshake_timeout),
            ("readTimeout", self.read_timeout),
            ("pingInterval", self.ping_interval),
            ("writeTimeout", self.write_timeout),
        ] {
            ensure!(!duration.is_zero(), ZeroDurationSnafu { field });
        }
        Ok(())
    }
}

impl Default for WebSocketOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Self::default_handshake_timeout(),
            read_timeout: Self::default_read_timeout(),
            ping_interval: Self::default_ping_interval(),
            write_timeout: Self::default_write_timeout(),
        }
    }
}

/// A compiled forbidden-content pattern
#[derive(Deserialize, Clone, Debug)]
#[serde(try_from = "String")]
pub struct DenyPattern(Regex);

impl TryFrom<String> for DenyPattern {
    type Error = regex::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Regex::new(&value).map(DenyPattern)
    }
}

impl Deref for DenyPattern {
    type Target = Regex;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Credential read from the options file, hidden from `Debug` output
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Creates a publisher/handle pair sharing `initial` as the first snapshot
pub fn channel(initial: RuntimeOptions) -> (OptionsPublisher, OptionsHandle) {
    let (tx, rx) = watch::channel(Arc::new(initial));
    (OptionsPublisher { tx }, OptionsHandle { rx })
}

/// Replaces the published snapshot, never mutating an existing one
pub struct OptionsPublisher {
    tx: watch::Sender<Arc<RuntimeOptions>>,
}

impl OptionsPublisher {
    pub fn publish(&self, opts: RuntimeOptions) {
        self.tx.send_replace(Arc::new(opts));
    }

    pub fn reload(&self, path: &Path) -> Result<(), Error> {
        self.publish(RuntimeOptions::from_yaml_file(path)?);
        tracing::info!(?path, "reloaded runtime options");
        Ok(())
    }
}

/// Cheap, cloneable read access to the current [`RuntimeOptions`]
#[derive(Clone, Debug)]
pub struct OptionsHandle {
    rx: watch::Receiver<Arc<RuntimeOptions>>,
}

impl OptionsHandle {
    /// Handle to a snapshot that never changes
    pub fn fixed(opts: RuntimeOptions) -> Self {
        channel(opts).1
    }

    pub fn snapshot(&self) -> Arc<RuntimeOptions> {
        self.rx.borrow().clone()
    }
}
