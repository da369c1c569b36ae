use std::path::PathBuf;

use clap::{crate_description, crate_version, Parser};
use rpaas_instance_manager::{
    config::{self, RuntimeOptions},
    crd::{RpaasFlavor, RpaasInstance, RpaasPlan},
    gateway::KubeGateway,
    manager::InstanceManager,
};
use stackable_operator::{logging::TracingTarget, CustomResourceExt};
use tokio::signal::unix::{signal, SignalKind};

pub const APP_NAME: &str = "rpaas-instance-manager";

#[derive(clap::Parser)]
#[clap(author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: stackable_operator::cli::Command<InstanceManagerRun>,
}

#[derive(clap::Parser)]
struct InstanceManagerRun {
    /// YAML file with the runtime options, reloaded on SIGHUP
    #[clap(long, env)]
    options_file: PathBuf,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    pub tracing_target: TracingTarget,
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        stackable_operator::cli::Command::Crd => {
            RpaasInstance::print_yaml_schema()?;
            RpaasPlan::print_yaml_schema()?;
            RpaasFlavor::print_yaml_schema()?;
        }
        stackable_operator::cli::Command::Run(InstanceManagerRun {
            options_file,
            tracing_target,
        }) => {
            stackable_operator::logging::initialize_logging(
                "RPAAS_INSTANCE_MANAGER_LOG",
                APP_NAME,
                tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let (publisher, options) =
                config::channel(RuntimeOptions::from_yaml_file(&options_file)?);
            let client = stackable_operator::client::create_client(Some(
                "rpaas.extensions.tsuru.io".to_string(),
            ))
            .await?;
            let gateway = KubeGateway::new(client.as_kube_client());
            let manager = InstanceManager::new(gateway.clone(), gateway, options);

            let plans = manager.get_plans().await?;
            let flavors = manager.get_flavors().await?;
            tracing::info!(
                service = %manager.options().service_name,
                plans = plans.len(),
                flavors = flavors.len(),
                "instance manager ready"
            );

            let mut sighup = signal(SignalKind::hangup())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            loop {
                tokio::select! {
                    _ = sighup.recv() => {
                        if let Err(err) = publisher.reload(&options_file) {
                            tracing::error!(
                                error = &err as &dyn std::error::Error,
                                "failed to reload runtime options, keeping the previous ones"
                            );
                        }
                    }
                    _ = sigterm.recv() => break,
                }
            }
        }
    }
    Ok(())
}
