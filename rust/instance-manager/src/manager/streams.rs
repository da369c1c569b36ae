//! Log tailing and interactive shells
//!
//! The cluster side of exec and debug sessions is provided by a [`RemoteShell`] hook. The
//! client side is a framed bidirectional stream, driven by [`relay`] with an idle timeout and
//! periodic keepalive pings.

use std::time::Duration;

use async_trait::async_trait;
use futures::{future::try_join_all, Sink, SinkExt as _, Stream, StreamExt as _};
use serde::Deserialize;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{k8s_openapi::api::core::v1::Pod, kube::ResourceExt};
use tokio::{
    io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _},
    sync::mpsc,
    time::{interval_at, sleep, timeout, Instant},
};

use super::{info, purge::BoxError, GetInstanceError, InstanceManager};
use crate::{
    config::WebSocketOptions,
    error::{error_full_message, ErrorKind, ManagerError},
    gateway::{self, Gateway, LogOptions},
};

const DEFAULT_CONTAINER: &str = "nginx";

fn since_seconds(since: Duration) -> i64 {
    i64::try_from(since.as_secs()).unwrap_or(i64::MAX)
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum Error {
    #[snafu(display("command is required"))]
    MissingCommand,

    #[snafu(display("no debug image configured"))]
    MissingDebugImage,

    #[snafu(display("interactive shells are not available"))]
    NoRemoteShell,

    #[snafu(display("failed to load instance"))]
    GetInstance { source: GetInstanceError },

    #[snafu(display("failed to list pods"))]
    ListPods { source: info::Error },

    #[snafu(display("no pods found for instance {instance:?}"))]
    NoPods { instance: String },

    #[snafu(display("pod {pod:?} not found in instance {instance:?}"))]
    PodNotFound { pod: String, instance: String },

    #[snafu(display("container {container:?} not found"))]
    ContainerNotFound { container: String },

    #[snafu(display("failed to stream logs"))]
    Logs { source: gateway::Error },

    #[snafu(display("remote shell failed"))]
    Shell { source: BoxError },
}

impl ManagerError for Error {
    fn kind(&self) -> ErrorKind {
        match self {
            Error::MissingCommand | Error::MissingDebugImage => ErrorKind::Validation,
            Error::NoRemoteShell | Error::Shell { .. } => ErrorKind::Internal,
            Error::GetInstance { source } => source.kind(),
            Error::ListPods { source } => source.kind(),
            Error::NoPods { .. } | Error::PodNotFound { .. } | Error::ContainerNotFound { .. } => {
                ErrorKind::NotFound
            }
            Error::Logs { source } => source.kind(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogArgs {
    /// Only this pod, every pod of the instance otherwise
    #[serde(default)]
    pub pod: Option<String>,
    /// Only this container, every container of the pod otherwise
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub lines: Option<i64>,
    #[serde(default, with = "humantime_serde")]
    pub since: Option<Duration>,
    #[serde(default)]
    pub with_timestamp: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct TerminalSize {
    pub width: u16,
    pub height: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecArgs {
    pub command: Vec<String>,
    #[serde(default)]
    pub pod: Option<String>,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub terminal_size: Option<TerminalSize>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugArgs {
    #[serde(flatten)]
    pub exec: ExecArgs,
    /// Image of the ephemeral container, defaults to the configured debug image
    #[serde(default)]
    pub image: Option<String>,
}

/// Process to start inside a pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellTarget {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub tty: bool,
    pub interactive: bool,
    pub terminal_size: Option<TerminalSize>,
    /// Set for debug sessions, which run in an ephemeral container
    pub image: Option<String>,
}

/// Byte streams plumbed between the caller and the remote process
pub struct ShellIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Box<dyn AsyncWrite + Send + Unpin>,
    pub stderr: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub resize: Option<mpsc::Receiver<TerminalSize>>,
}

/// Runs processes inside nginx pods
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, target: ShellTarget, io: ShellIo) -> Result<(), BoxError>;

    /// Runs `target` in an ephemeral container of `target.image` attached to the pod
    async fn debug(&self, target: ShellTarget, io: ShellIo) -> Result<(), BoxError>;
}

fn container_names(pod: &Pod) -> Vec<String> {
    pod.spec
        .iter()
        .flat_map(|spec| &spec.containers)
        .map(|container| container.name.clone())
        .collect()
}

fn is_running(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running")
}

impl<G: Gateway> InstanceManager<G> {
    async fn instance_pods(&self, name: &str) -> Result<(String, Vec<Pod>), Error> {
        let instance = self
            .get_instance(name)
            .await
            .context(error::GetInstanceSnafu)?;
        let pods = match self.nginx(&instance).await.context(error::ListPodsSnafu)? {
            Some(nginx) => self
                .nginx_pods(&instance, &nginx)
                .await
                .context(error::ListPodsSnafu)?,
            None => Vec::new(),
        };
        ensure!(!pods.is_empty(), error::NoPodsSnafu { instance: name });
        Ok((instance.namespace().unwrap_or_default(), pods))
    }

    /// Streams log lines of the selected pods and containers to `sink`, each prefixed with
    /// `[pod][container]`
    pub async fn log(
        &self,
        name: &str,
        args: LogArgs,
        sink: mpsc::Sender<String>,
    ) -> Result<(), Error> {
        let (namespace, pods) = self.instance_pods(name).await?;
        let mut sources = Vec::new();
        for pod in pods {
            let pod_name = pod.name_any();
            if args.pod.as_ref().is_some_and(|wanted| *wanted != pod_name) {
                continue;
            }
            for container in container_names(&pod) {
                if args.container.as_ref().is_some_and(|wanted| *wanted != container) {
                    continue;
                }
                sources.push((pod_name.clone(), container));
            }
        }
        if let Some(pod) = &args.pod {
            ensure!(
                sources.iter().any(|(pod_name, _)| pod_name == pod),
                error::PodNotFoundSnafu {
                    pod,
                    instance: name
                }
            );
        }
        if let Some(container) = &args.container {
            ensure!(
                !sources.is_empty(),
                error::ContainerNotFoundSnafu { container }
            );
        }

        let since_seconds = args.since.map(since_seconds);
        try_join_all(sources.into_iter().map(|(pod, container)| {
            let namespace = namespace.as_str();
            let sink = sink.clone();
            let opts = LogOptions {
                container: Some(container.clone()),
                follow: args.follow,
                tail_lines: args.lines,
                since_seconds,
                timestamps: args.with_timestamp,
            };
            async move {
                let (lines, mut received) = mpsc::channel(16);
                let forward = async {
                    while let Some(line) = received.recv().await {
                        if sink.send(format!("[{pod}][{container}] {line}")).await.is_err() {
                            break;
                        }
                    }
                };
                let (streamed, ()) = tokio::join!(
                    self.client.pod_logs(namespace, &pod, &opts, lines),
                    forward
                );
                streamed
            }
        }))
        .await
        .context(error::LogsSnafu)?;
        Ok(())
    }

    pub async fn exec(&self, name: &str, args: ExecArgs, io: ShellIo) -> Result<(), Error> {
        let shell = self.remote_shell.as_ref().context(error::NoRemoteShellSnafu)?;
        let target = self.shell_target(name, args, None).await?;
        tracing::info!(pod = %target.pod, container = %target.container, "starting exec session");
        shell.exec(target, io).await.context(error::ShellSnafu)
    }

    pub async fn debug(&self, name: &str, args: DebugArgs, io: ShellIo) -> Result<(), Error> {
        let shell = self.remote_shell.as_ref().context(error::NoRemoteShellSnafu)?;
        let image = args
            .image
            .or_else(|| self.options().debug_image.clone())
            .filter(|image| !image.is_empty())
            .context(error::MissingDebugImageSnafu)?;
        let target = self.shell_target(name, args.exec, Some(image)).await?;
        tracing::info!(pod = %target.pod, image = target.image.as_deref(), "starting debug session");
        shell.debug(target, io).await.context(error::ShellSnafu)
    }

    /// Picks the requested pod, or the first running one
    async fn shell_target(
        &self,
        name: &str,
        args: ExecArgs,
        image: Option<String>,
    ) -> Result<ShellTarget, Error> {
        ensure!(!args.command.is_empty(), error::MissingCommandSnafu);
        let (namespace, pods) = self.instance_pods(name).await?;
        let pod = match &args.pod {
            Some(wanted) => pods
                .into_iter()
                .find(|pod| pod.name_any() == *wanted)
                .context(error::PodNotFoundSnafu {
                    pod: wanted,
                    instance: name,
                })?,
            None => pods
                .into_iter()
                .find(is_running)
                .context(error::NoPodsSnafu { instance: name })?,
        };
        let container = args
            .container
            .unwrap_or_else(|| DEFAULT_CONTAINER.to_string());
        if image.is_none() {
            ensure!(
                container_names(&pod).contains(&container),
                error::ContainerNotFoundSnafu {
                    container: &container
                }
            );
        }
        Ok(ShellTarget {
            namespace,
            pod: pod.name_any(),
            container,
            command: args.command,
            tty: args.tty,
            interactive: args.interactive,
            terminal_size: args.terminal_size,
            image,
        })
    }
}

/// Message on the client side of a stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    /// Carries the error text when the stream ends on a failure
    Close(Option<String>),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamTimeouts {
    /// The stream is closed when nothing is received for this long
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
}

impl From<&WebSocketOptions> for StreamTimeouts {
    fn from(opts: &WebSocketOptions) -> Self {
        Self {
            idle_timeout: opts.read_timeout,
            ping_interval: opts.ping_interval,
            write_timeout: opts.write_timeout,
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(module)]
pub enum RelayError {
    #[snafu(display("failed to receive frame"))]
    Receive { source: BoxError },

    #[snafu(display("failed to send frame"))]
    Send { source: BoxError },

    #[snafu(display("timed out sending frame after {timeout:?}"))]
    WriteTimeout { timeout: Duration },

    #[snafu(display("no frame received for {timeout:?}"))]
    IdleTimeout { timeout: Duration },

    #[snafu(display("failed to read from remote process"))]
    ReadRemote { source: std::io::Error },

    #[snafu(display("failed to write to remote process"))]
    WriteRemote { source: std::io::Error },
}

async fn send_frame<O>(
    outbound: &mut O,
    frame: Frame,
    write_timeout: Duration,
) -> Result<(), RelayError>
where
    O: Sink<Frame> + Unpin,
    O::Error: std::error::Error + Send + Sync + 'static,
{
    timeout(write_timeout, outbound.send(frame))
        .await
        .map_err(|_| {
            relay_error::WriteTimeoutSnafu {
                timeout: write_timeout,
            }
            .build()
        })?
        .map_err(|err| RelayError::Send {
            source: Box::new(err),
        })
}

/// Shuttles frames between a client and a remote process until either side closes.
///
/// Inbound data is written to `to_remote`, output read from `from_remote` is sent as data
/// frames. Every inbound frame resets the idle deadline, and a ping is sent each
/// `ping_interval`. The stream always ends with a close frame, carrying the error text when
/// the relay fails.
pub async fn relay<I, E, O, R, W>(
    mut inbound: I,
    mut outbound: O,
    mut to_remote: W,
    mut from_remote: R,
    timeouts: StreamTimeouts,
) -> Result<(), RelayError>
where
    I: Stream<Item = Result<Frame, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    O: Sink<Frame> + Unpin,
    O::Error: std::error::Error + Send + Sync + 'static,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let idle = sleep(timeouts.idle_timeout);
    tokio::pin!(idle);
    let mut ping = interval_at(
        Instant::now() + timeouts.ping_interval,
        timeouts.ping_interval,
    );
    let mut buf = vec![0; 8192];

    let result = loop {
        tokio::select! {
            frame = inbound.next() => {
                let frame = match frame {
                    None => break Ok(()),
                    Some(Err(err)) => break Err(RelayError::Receive { source: Box::new(err) }),
                    Some(Ok(frame)) => frame,
                };
                idle.as_mut().reset(Instant::now() + timeouts.idle_timeout);
                match frame {
                    Frame::Data(data) => {
                        let written = async {
                            to_remote.write_all(&data).await?;
                            to_remote.flush().await
                        };
                        if let Err(err) = written.await.context(relay_error::WriteRemoteSnafu) {
                            break Err(err);
                        }
                    }
                    Frame::Ping(payload) => {
                        let pong = Frame::Pong(payload);
                        if let Err(err) = send_frame(&mut outbound, pong, timeouts.write_timeout).await {
                            break Err(err);
                        }
                    }
                    Frame::Pong(_) => {}
                    Frame::Close(_) => break Ok(()),
                }
            }
            read = from_remote.read(&mut buf) => {
                match read.context(relay_error::ReadRemoteSnafu) {
                    Ok(0) => break Ok(()),
                    Ok(len) => {
                        let frame = Frame::Data(buf[..len].to_vec());
                        if let Err(err) = send_frame(&mut outbound, frame, timeouts.write_timeout).await {
                            break Err(err);
                        }
                    }
                    Err(err) => break Err(err),
                }
            }
            _ = ping.tick() => {
                let ping = Frame::Ping(Vec::new());
                if let Err(err) = send_frame(&mut outbound, ping, timeouts.write_timeout).await {
                    break Err(err);
                }
            }
            () = &mut idle => {
                break Err(RelayError::IdleTimeout { timeout: timeouts.idle_timeout });
            }
        }
    };

    if let Err(err) = to_remote.shutdown().await {
        tracing::debug!(error = &err as &dyn std::error::Error, "failed to close remote input");
    }
    let close = Frame::Close(result.as_ref().err().map(|err| error_full_message(err)));
    if let Err(err) = send_frame(&mut outbound, close, timeouts.write_timeout).await {
        tracing::debug!(error = &err as &dyn std::error::Error, "failed to send close frame");
    }
    result
}
