//! dataplane-installer - provisions the Pulumi Kubernetes Operator and the
//! data-plane stack it reconciles

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dataplane_installer::bootstrap::{BootstrapOptions, Bootstrapper};
use dataplane_installer::config::Configuration;
use dataplane_installer::kube_api::{ClusterApi, DisconnectedClusterApi, KubeClusterApi};
use dataplane_installer::manifest::TemplateSet;
use dataplane_installer::telemetry::{self, LogFormat};

/// Provision the data-plane operator and stack from one configuration file
#[derive(Parser, Debug)]
#[command(name = "dataplane-installer", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Installer configuration (YAML or JSON)
    #[arg(
        short = 'f',
        long = "config",
        env = "DATAPLANE_CONFIG",
        default_value = "dataplane.yaml",
        global = true
    )]
    config: PathBuf,

    /// Kubeconfig to use instead of the inferred one
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Directory whose templates take precedence over the packaged ones
    #[arg(long, env = "DATAPLANE_TEMPLATES_DIR", global = true)]
    templates_dir: Option<PathBuf>,

    /// Field manager for server-side apply
    #[arg(
        long,
        env = "DATAPLANE_FIELD_MANAGER",
        default_value = dataplane_installer::FIELD_MANAGER,
        global = true
    )]
    field_manager: String,

    /// Seconds to wait for the operator to become ready
    #[arg(long, env = "DATAPLANE_READINESS_TIMEOUT", default_value_t = 300, global = true)]
    readiness_timeout: u64,

    /// Emit JSON log lines
    #[arg(long, env = "DATAPLANE_JSON_LOGS", global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Provision everything (default)
    Install,
    /// Print every manifest an install would write, without a cluster
    Render,
    /// Report operator readiness, managed deployments and stack state
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.global.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    telemetry::init(format)?;

    let command = cli.command.unwrap_or(Command::Install);
    if let Err(e) = run(command, &cli.global).await {
        error!(error = %format!("{:#}", e), "installer failed");
        return Err(e);
    }
    Ok(())
}

async fn run(command: Command, args: &GlobalArgs) -> anyhow::Result<()> {
    let config = Configuration::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let mut templates = TemplateSet::packaged();
    if let Some(dir) = &args.templates_dir {
        templates = templates.with_override_dir(dir);
    }

    let cancel = CancellationToken::new();
    let options = BootstrapOptions {
        templates,
        field_manager: args.field_manager.clone(),
        readiness_timeout: Duration::from_secs(args.readiness_timeout),
        cancel: cancel.clone(),
        ..Default::default()
    };

    let api: Arc<dyn ClusterApi> = match command {
        Command::Render => Arc::new(DisconnectedClusterApi),
        Command::Install | Command::Status => Arc::new(
            KubeClusterApi::connect(args.kubeconfig.as_deref())
                .await
                .context("connecting to the cluster")?,
        ),
    };
    let bootstrapper = Bootstrapper::new(api, config, options).context("invalid configuration")?;

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling");
                cancel.cancel();
            }
        }
    });

    match command {
        Command::Install => {
            bootstrapper.run().await?;
            info!("installation complete");
        }
        Command::Render => {
            for manifest in bootstrapper.plan()? {
                print!("---\n{}", serde_yaml::to_string(&manifest)?);
            }
        }
        Command::Status => {
            let report = bootstrapper.status().await?;
            print!("{}", report);
        }
    }
    Ok(())
}
