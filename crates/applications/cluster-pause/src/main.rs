//! pausectl - pause and resume an EKS environment
//!
//! ## Usage
//!
//! ```bash
//! # Stop everything tagged KubernetesCluster=demo-ns, including its Aurora clusters
//! pausectl --action stop --namespace demo-ns
//!
//! # Start it again without touching RDS, no prompt
//! KERNEL_NAMESPACE=demo-ns pausectl --action start --no-rds --yes
//!
//! # Print the transition summary as JSON and keep a log file
//! pausectl --action stop --namespace demo-ns --json --log-dir ./logs
//! ```

use clap::{ArgAction, Parser, ValueEnum};
use cluster_pause::{
    AsgAutoscaling, Collaborators, Ec2Compute, Environment, KubeConnector, PauseAction, PauseConfig,
    RdsDatabase, load_aws_config, pipeline,
};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Transition to perform
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    /// Resume a stopped environment
    Start,
    /// Pause a running environment
    Stop,
}

impl From<Action> for PauseAction {
    fn from(action: Action) -> Self {
        match action {
            Action::Start => PauseAction::Start,
            Action::Stop => PauseAction::Stop,
        }
    }
}

/// pausectl: stop and start an EKS environment with its EC2, RDS and ASG resources
#[derive(Parser)]
#[command(name = "pausectl")]
#[command(about = "Pause and resume an EKS environment", long_about = None)]
struct Cli {
    /// Transition to perform
    #[arg(long, value_enum)]
    action: Action,

    /// Environment namespace (value of the cluster tag)
    #[arg(long, env = "KERNEL_NAMESPACE")]
    namespace: String,

    /// Also start/stop the environment's RDS clusters (default)
    #[arg(long, conflicts_with = "no_rds")]
    rds: bool,

    /// Leave RDS clusters alone
    #[arg(long = "no-rds", action = ArgAction::SetTrue)]
    no_rds: bool,

    /// Skip the confirmation prompt
    #[arg(long, short = 'y')]
    yes: bool,

    /// Kubeconfig path (default: inferred)
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context (default: current context)
    #[arg(long)]
    context: Option<String>,

    /// AWS region (default: us-east-1)
    #[arg(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Seconds to wait for EC2 instances to reach running/stopped
    #[arg(long, default_value_t = cluster_pause::instance::DEFAULT_WAITER_TIMEOUT_SECS)]
    waiter_timeout: u64,

    /// Tag key identifying environment resources
    #[arg(long, default_value = cluster_pause::config::DEFAULT_CLUSTER_TAG_KEY)]
    cluster_tag_key: String,

    /// Print the transition summary as JSON
    #[arg(long)]
    json: bool,

    /// Also write logs to pausectl.log in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

impl Cli {
    fn include_database(&self) -> bool {
        self.rds || !self.no_rds
    }
}

/// Ask on stdin; anything but y/yes aborts
fn confirm(description: &str, env: &Environment) -> anyhow::Result<bool> {
    println!("{} '{}'", description, env);
    print!("Continue? [y/N]: ");
    std::io::stdout().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_lowercase().starts_with('y'))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let (file_layer, _guard) = match &cli.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, "pausectl.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cluster_pause=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    let action = PauseAction::from(cli.action);
    let env = Environment::new(cli.namespace.clone())?;
    let include_database = cli.include_database();

    if !cli.yes && !confirm(action.describe(), &env)? {
        info!("Aborted");
        return Ok(());
    }

    let config = PauseConfig::default().with_cluster_tag_key(&cli.cluster_tag_key);
    let aws = load_aws_config(cli.region.clone()).await;

    let collaborators = Collaborators {
        connector: Arc::new(KubeConnector::new(cli.kubeconfig.clone(), cli.context.clone())),
        compute: Arc::new(
            Ec2Compute::from_config(&aws, &config.cluster_tag_key)
                .with_waiter_timeout(Duration::from_secs(cli.waiter_timeout)),
        ),
        database: Arc::new(RdsDatabase::from_config(&aws)),
        autoscaling: Arc::new(AsgAutoscaling::from_config(&aws, &config.cluster_tag_key)),
    };

    info!(%action, namespace = %env, include_database, "Transition requested");

    let summary = match pipeline::run(action, &env, include_database, config, collaborators).await {
        Ok(summary) => summary,
        Err(e) => {
            error!(%action, namespace = %env, error = %e, "Transition failed");
            return Err(e.into());
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            %action,
            namespace = %env,
            duration_secs = summary.duration_secs().unwrap_or_default(),
            "Transition complete"
        );
    }

    Ok(())
}
