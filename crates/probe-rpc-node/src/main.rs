//! probe-rpc node.
//!
//! `serve` publishes the demo services to the configured registry and answers
//! calls until interrupted. `call` sends a single request and prints the
//! result.

mod services;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use probe_rpc::{DispatchPool, NodeConfig, RegistryBackendKind, RpcClient, RpcRequest, RpcServer};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "probe-rpc")]
#[command(about = "Minimal RPC node: serve demo services or call a remote method")]
struct Args {
    /// TOML configuration file layered over the built-in defaults
    #[arg(short, long, env = "PROBE_RPC_CONFIG")]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Publish the demo services and serve calls until Ctrl-C
    Serve {
        /// Port to listen on and publish (must be non-zero)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to and publish
        #[arg(long)]
        host: Option<String>,

        /// Registry backend: path (zookeeper) or flat (consul)
        #[arg(long)]
        registry: Option<String>,

        /// Registry address: memory, sqlite://<file> or http://<agent>
        #[arg(long)]
        registry_address: Option<String>,
    },

    /// Call one method and print the result as JSON
    Call {
        /// Server address, host:port
        addr: String,

        /// Interface name, e.g. Greeter
        interface: String,

        /// Method name, e.g. echo
        method: String,

        /// Arguments as a JSON array
        #[arg(default_value = "[]")]
        params: String,

        /// Comma-separated parameter type names, e.g. string,i64
        #[arg(short = 't', long, value_delimiter = ',')]
        types: Vec<String>,

        /// Give up waiting for the response after this many milliseconds
        #[arg(long)]
        read_timeout_ms: Option<u64>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let mut config = NodeConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    match args.command {
        Command::Serve {
            port,
            host,
            registry,
            registry_address,
        } => {
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(backend) = registry {
                config.registry.backend = RegistryBackendKind::from_str(&backend)
                    .with_context(|| format!("Unknown registry backend: {}", backend))?;
            }
            if let Some(address) = registry_address {
                config.registry.address = address;
            }
            config.validate()?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.server.io_threads())
                .thread_name("rpc-io")
                .enable_all()
                .build()?;
            runtime.block_on(serve(config))
        }
        Command::Call {
            addr,
            interface,
            method,
            params,
            types,
            read_timeout_ms,
        } => {
            if read_timeout_ms.is_some() {
                config.client.read_timeout_ms = read_timeout_ms;
            }
            call(config, &addr, interface, method, &params, types)
        }
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    info!("Starting probe-rpc node");
    DispatchPool::init_global(&config.pool);

    let container = services::demo_container();
    let mut handle = RpcServer::new(&config).start(&container).await?;

    // Print the port for scripts driving the node
    println!("RPC_PORT={}", handle.port());
    info!(
        "Serving {} interface(s) on {}",
        handle.instances().len(),
        handle.addr()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    handle.shutdown().await?;
    Ok(())
}

fn call(
    config: NodeConfig,
    addr: &str,
    interface: String,
    method: String,
    params: &str,
    types: Vec<String>,
) -> Result<()> {
    let parameters: Vec<Value> =
        serde_json::from_str(params).context("Arguments must be a JSON array")?;
    if !types.is_empty() && types.len() != parameters.len() {
        bail!(
            "{} type name(s) given for {} argument(s)",
            types.len(),
            parameters.len()
        );
    }

    let mut request = RpcRequest::new(interface, method).with_parameters(parameters);
    request.parameter_types = types;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let client = RpcClient::new(config.client);
    let response = runtime.block_on(client.call_endpoint(addr, request))?;

    let result = response.into_result()?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
