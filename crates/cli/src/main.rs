//! clusterops CLI
//!
//! Opens, stops and lists port-forwards and shows cluster resource reports
//! through a running clusterops server.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{metrics, port_forward};

#[derive(Parser)]
#[command(name = "cops")]
#[command(author, version, about = "CLI for clusterops port-forwards and cluster metrics", long_about = None)]
pub struct Cli {
    /// Server URL (defaults to the config file value, then http://localhost:8080)
    #[arg(long, env = "CLUSTEROPS_URL")]
    pub server_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage port-forwards
    #[command(subcommand, visible_alias = "pf")]
    PortForward(PortForwardCommands),

    /// Show cluster resource metrics
    Metrics {
        /// Print the server's plain-text report
        #[arg(long)]
        text: bool,
    },
}

#[derive(Subcommand)]
pub enum PortForwardCommands {
    /// Forward a local port to a resource in the cluster
    Open {
        /// Resource name, e.g. a pod or service name
        resource: String,

        /// LOCAL:REMOTE ports, or a single port for both
        #[arg(value_parser = port_forward::parse_port_pair)]
        ports: (u16, u16),

        /// Namespace (defaults to the config file value, then the server default)
        #[arg(long, short)]
        namespace: Option<String>,

        /// Resource type: pod, service, deployment, statefulset, replicaset
        #[arg(long = "type", short = 't')]
        resource_type: Option<String>,
    },

    /// Stop the port-forward on a local port
    Stop {
        local_port: u16,
    },

    /// List port-forwards
    List,

    /// Remove port-forwards whose process has exited
    Prune,
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let client = client::ApiClient::new(&config.server_url(cli.server_url))?;

    match cli.command {
        Commands::PortForward(command) => match command {
            PortForwardCommands::Open {
                resource,
                ports,
                namespace,
                resource_type,
            } => {
                port_forward::open(
                    &client,
                    resource,
                    ports,
                    config.namespace(namespace),
                    resource_type,
                    cli.format,
                )
                .await?;
            }
            PortForwardCommands::Stop { local_port } => {
                port_forward::stop(&client, local_port, cli.format).await?;
            }
            PortForwardCommands::List => {
                port_forward::list(&client, cli.format).await?;
            }
            PortForwardCommands::Prune => {
                port_forward::prune(&client, cli.format).await?;
            }
        },
        Commands::Metrics { text } => {
            metrics::show(&client, text, cli.format).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
