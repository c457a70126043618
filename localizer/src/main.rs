#![forbid(unsafe_code)]

use clap::{Parser, Subcommand, ValueEnum};
use ipnet::Ipv4Net;
use tracing_subscriber::EnvFilter;

mod commands;
mod daemon;
mod server;

#[derive(Debug, Parser)]
#[command(
    name = "localizer",
    version,
    about = "Expose Kubernetes services to your local machine, and local services to the cluster"
)]
struct Args {
    /// Kubernetes context to use. KUBECONFIG is respected as-is.
    #[arg(long, env = "KUBECONTEXT", global = true)]
    context: Option<String>,

    /// Limit watches to a single namespace instead of the whole cluster.
    #[arg(long, global = true)]
    namespace: Option<String>,

    /// DNS suffix used for fully-qualified service names.
    #[arg(long, default_value = "cluster.local", global = true)]
    cluster_domain: String,

    /// CIDR that dedicated loopback addresses are allocated from.
    #[arg(long, default_value = "127.0.0.1/8", global = true)]
    ip_cidr: Ipv4Net,

    /// Skip services in this namespace; repeatable. kube-system is always
    /// skipped.
    #[arg(long = "skip-namespace", global = true)]
    skip_namespaces: Vec<String>,

    /// Set the log level.
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Set the log format.
    #[arg(long, env = "LOG_FORMAT", default_value = "plain", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List all port-forwarded services and their statuses.
    List,
    /// Expose ports for a given service to Kubernetes.
    Expose {
        /// The service to expose, as namespace/service.
        target: String,

        /// Map a local port to a remote port, i.e. --map 80:8080 will bind
        /// what is normally :8080 to :80 locally.
        #[arg(long = "map")]
        map: Vec<String>,

        /// Stop exposing the service.
        #[arg(long)]
        stop: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(&args);

    let result = match &args.command {
        Some(Command::List) => commands::list().await,
        Some(Command::Expose { target, map, stop }) => {
            commands::expose(target, map, *stop).await
        }
        None => {
            daemon::run(daemon::Options {
                context: args.context.clone(),
                namespace: args.namespace.clone(),
                cluster_domain: args.cluster_domain.clone(),
                ip_cidr: args.ip_cidr,
                skip_namespaces: args.skip_namespaces.clone(),
            })
            .await
        }
    };

    if let Err(err) = result {
        tracing::error!("failed to run: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(args: &Args) {
    let filter =
        EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match args.log_format {
        LogFormat::Plain => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}
