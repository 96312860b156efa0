//! IAM role to service account mapping - grant service and in-pod agent

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use iam_sa_mapping::agent::{Agent, HttpProfileFetcher};
use iam_sa_mapping::catalog::{KubeConfigStore, RoleCatalog};
use iam_sa_mapping::config::{AgentConfig, ServiceConfig};
use iam_sa_mapping::coordinator::Coordinator;
use iam_sa_mapping::identity::{IdentityResolver, KubePodLister};
use iam_sa_mapping::oracle::{HttpIdentityOracle, IdentityOracle};
use iam_sa_mapping::server::{self, AppState};
use iam_sa_mapping::trust::{AwsIamClient, TrustPolicyReconciler};
use iam_sa_mapping::{
    DEFAULT_ACCOUNT_PREFIX_LEN, DEFAULT_COMPUTE_NAMESPACE, DEFAULT_PLATFORM_NAMESPACE,
    DEFAULT_USER_HOST, DEFAULT_WEB_IDENTITY_TOKEN_FILE,
};

/// Grants compute pods the right to assume IAM roles
#[derive(Parser, Debug)]
#[command(name = "iam-sa-mapping", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the grant service
    Serve(ServeArgs),

    /// Run the in-pod agent that writes the pod's AWS config
    Agent(AgentArgs),
}

/// Grant service arguments
#[derive(Parser, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:6000")]
    listen_addr: SocketAddr,

    /// Namespace holding the mapping ConfigMaps
    #[arg(long, env = "PLATFORM_NS", default_value = DEFAULT_PLATFORM_NAMESPACE)]
    platform_namespace: String,

    /// Namespace where compute pods run
    #[arg(long, env = "COMPUTE_NS", default_value = DEFAULT_COMPUTE_NAMESPACE)]
    compute_namespace: String,

    /// Cluster OIDC provider, without scheme
    #[arg(long, env = "OIDC_PROVIDER")]
    oidc_provider: String,

    /// Base URL of the user API
    #[arg(long, env = "DOMINO_USER_HOST", default_value = DEFAULT_USER_HOST)]
    user_host: String,

    /// Length of the system prefix on pod service account names
    #[arg(long, env = "ACCOUNT_PREFIX_LEN", default_value_t = DEFAULT_ACCOUNT_PREFIX_LEN)]
    account_prefix_len: usize,

    /// Web identity token path written into generated profiles
    #[arg(
        long,
        env = "WEB_IDENTITY_TOKEN_FILE",
        default_value = DEFAULT_WEB_IDENTITY_TOKEN_FILE
    )]
    web_identity_token_file: String,
}

impl From<ServeArgs> for ServiceConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            listen_addr: args.listen_addr,
            platform_namespace: args.platform_namespace,
            compute_namespace: args.compute_namespace,
            oidc_provider: args.oidc_provider,
            user_host: args.user_host,
            account_prefix_len: args.account_prefix_len,
            web_identity_token_file: args.web_identity_token_file,
        }
    }
}

/// Agent arguments
#[derive(Parser, Debug)]
struct AgentArgs {
    /// Grant endpoint URL
    #[arg(long, env = "IAM_SA_MAPPING_ENDPOINT")]
    endpoint: String,

    /// Prefix applied to every file path
    #[arg(long, env = "ROOT_PATH")]
    root_path: Option<PathBuf>,

    /// Downward API file with the pod's labels
    #[arg(long, env = "POD_INFO_PATH")]
    pod_info_path: PathBuf,

    /// File holding the platform bearer token
    #[arg(long, env = "DOMINO_TOKEN_FILE")]
    token_file: PathBuf,

    /// Where to write the AWS config
    #[arg(long, env = "AWS_CONFIG_FILE")]
    aws_config_file: PathBuf,

    /// Seconds between failed attempts
    #[arg(long, env = "RETRY_INTERVAL_SECS", default_value = "5")]
    retry_interval_secs: u64,

    /// Seconds between keep-alive log lines
    #[arg(long, env = "KEEP_ALIVE_INTERVAL_SECS", default_value = "300")]
    keep_alive_interval_secs: u64,
}

impl From<AgentArgs> for AgentConfig {
    fn from(args: AgentArgs) -> Self {
        let config = Self {
            endpoint: args.endpoint,
            pod_info_path: args.pod_info_path,
            token_file: args.token_file,
            aws_config_file: args.aws_config_file,
            retry_interval: Duration::from_secs(args.retry_interval_secs),
            keep_alive_interval: Duration::from_secs(args.keep_alive_interval_secs),
        };
        match args.root_path {
            Some(root) => config.rooted(&root),
            None => config,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => run_server(args.into()).await,
        Commands::Agent(args) => run_agent(args.into()).await,
    }
}

/// Wire the real clients and serve the HTTP endpoints
async fn run_server(config: ServiceConfig) -> anyhow::Result<()> {
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let aws = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;

    let oracle: Arc<dyn IdentityOracle> = Arc::new(HttpIdentityOracle::new(&config.user_host)?);
    let catalog = Arc::new(RoleCatalog::new(
        Arc::new(KubeConfigStore::new(client.clone())),
        oracle.clone(),
    ));
    let coordinator = Arc::new(Coordinator::new(
        IdentityResolver::new(
            Arc::new(KubePodLister::new(client)),
            config.account_prefix_len,
        ),
        catalog.clone(),
        TrustPolicyReconciler::new(
            Arc::new(AwsIamClient::new(&aws)),
            config.oidc_provider.clone(),
        ),
    ));

    info!(
        platform_namespace = %config.platform_namespace,
        compute_namespace = %config.compute_namespace,
        oidc_provider = %config.oidc_provider,
        "Starting grant service"
    );

    let addr = config.listen_addr;
    let state = Arc::new(AppState {
        coordinator,
        catalog,
        oracle,
        config,
    });
    server::serve(addr, server::router(state)).await?;
    Ok(())
}

/// Poll the grant service until the pod's AWS config is written, then idle
async fn run_agent(config: AgentConfig) -> anyhow::Result<()> {
    info!(
        endpoint = %config.endpoint,
        aws_config_file = %config.aws_config_file.display(),
        "Starting agent"
    );
    let fetcher = Arc::new(HttpProfileFetcher::new(&config.endpoint)?);
    Agent::new(config, fetcher).run().await?;
    Ok(())
}
