use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use deployer::aws::Aws;
use deployer::chef::Knife;
use deployer::config::{Layout, RawSettings};
use deployer::host::{DeployOutcome, HostTasks};
use deployer::provision::{Provisioner, StdinConfirm};
use deployer::remote::Ssh;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
/// Provision EC2 hosts and converge them with chef-solo
struct Cli {
    /// Project root holding deploy/ and chef_files/
    #[clap(long, value_parser, default_value = ".")]
    root: PathBuf,

    /// JSON file with deploy settings, used for anything not set by flag or environment
    #[clap(long, value_parser)]
    config: Option<PathBuf>,

    #[clap(flatten)]
    settings: RawSettings,

    #[clap(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Create the keypair and security group if they do not exist
    SetupAwsAccount,

    /// Launch an instance and wait for it to start running
    CreateInstance {
        name: String,

        /// Extra tag to put on the instance
        #[clap(long, value_parser)]
        tag: Option<String>,
    },

    /// Terminate every instance with the given name, after confirmation
    TerminateInstance { name: String },

    /// Install chef on the host and run chef-solo with its node file
    Bootstrap {
        name: String,

        /// Skip the chef installation, only needed on the first run
        #[clap(long)]
        no_install: bool,
    },

    /// Deploy the app with the deploy node file, then restart it
    Deploy { name: String },

    /// Restart the app under supervisor and reload nginx
    Restart { name: String },

    /// Allocate an elastic IP and assign it to the instance
    AssociateIp { name: String },

    /// Open a shell on the instance
    Ssh { name: String },
}

async fn provisioner(cli: &Cli, layout: Layout) -> Result<Provisioner<Aws>> {
    let mut raw = cli.settings.clone();
    if let Some(path) = &cli.config {
        raw = raw.or(RawSettings::from_file(path)?);
    }
    let settings = raw.resolve()?;
    info!(?settings);

    let aws = Aws::new(&settings).await;
    Ok(Provisioner::new(aws, settings, layout))
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    let root = fs::canonicalize(&cli.root)
        .with_context(|| format!("project root {} not found", cli.root.display()))?;
    info!(root = %root.display());
    let layout = Layout::new(root);
    let host = HostTasks::new(Knife, Ssh, layout.clone());

    match &cli.task {
        Task::SetupAwsAccount => {
            let setup = provisioner(&cli, layout)
                .await?
                .setup_aws_account()
                .await
                .context("failed to set up aws account")?;
            info!(?setup, "account ready");
        }
        Task::CreateInstance { name, tag } => {
            let profile = provisioner(&cli, layout)
                .await?
                .create_instance(name, tag.as_deref())
                .await
                .with_context(|| format!("failed to create {name}"))?;
            println!("{}", profile.host_string);
        }
        Task::TerminateInstance { name } => {
            provisioner(&cli, layout)
                .await?
                .terminate_instance(name, &mut StdinConfirm)
                .await
                .with_context(|| format!("failed to terminate {name}"))?;
        }
        Task::AssociateIp { name } => {
            let ip = provisioner(&cli, layout)
                .await?
                .associate_ip(name)
                .await
                .with_context(|| format!("failed to associate an elastic IP with {name}"))?;
            println!("{ip}");
        }
        Task::Bootstrap { name, no_install } => host
            .bootstrap(name, *no_install)
            .with_context(|| format!("failed to bootstrap {name}"))?,
        Task::Deploy { name } => {
            if host.deploy(name)? == DeployOutcome::Failed {
                warn!(name = name.as_str(), "deploy did not complete, see errors above");
            }
        }
        Task::Restart { name } => host
            .restart(name)
            .with_context(|| format!("failed to restart {name}"))?,
        Task::Ssh { name } => host.ssh(name)?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::new("info,aws_config=warn");
    if let Ok(var) = std::env::var("RUST_LOG") {
        filter = filter.add_directive(var.parse()?);
    }
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run().await {
        error!(?e, "run error");
        std::process::exit(1);
    }

    Ok(())
}
