use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use serde::Serialize;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use enginepool::client::RemoteNode;
use enginepool::directory::{Directory, FsDirectory};
use enginepool::node::{NodeController, NodeServer, ScratchEngine, NODE_LOG_FILE};
use enginepool::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "enginepool")]
#[command(version)]
#[command(about = "Worker-node host and control tools for a pooled computation engine")]
struct Args {
    /// Support library search path handed down by the launcher
    #[arg(long)]
    lib_path: Option<String>,

    /// Security policy file handed down by the launcher
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Where the node may load engine support code from
    #[arg(long)]
    codebase: Option<String>,

    /// Hostname override for published addresses
    #[arg(long)]
    hostname: Option<String>,

    /// The directory endpoint requires a secure channel
    #[arg(long)]
    secure: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Host a node controller (the entry point the pool launcher spawns)
    Host(HostArgs),

    /// Ping a node's control endpoint
    Ping(ClientArgs),

    /// Bind a session on a node and evaluate a command
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        /// The command to evaluate
        command: String,
    },
}

#[derive(Parser, Debug)]
struct HostArgs {
    /// Assigned node name, published to the registry once the control
    /// server is up
    name: String,

    /// Registry directory to publish the node address under
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Verbose diagnostics; also keeps the working directory on stop
    #[arg(long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node name to resolve
    name: String,

    /// Registry directory the node published its address under
    #[arg(long)]
    registry: PathBuf,
}

#[derive(Serialize)]
struct PingOutput {
    name: String,
    address: String,
    rtt_ms: u128,
    os_type: String,
    version: String,
}

/// Log to the diagnostic file in the working directory and to stdout; the
/// launcher folds both into its error report when a launch fails.
fn init_host_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match std::fs::File::create(NODE_LOG_FILE) {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::io::stdout.and(Arc::new(file)))
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

async fn run_host(args: &Args, host: &HostArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_host_tracing(host.verbose);
    tracing::info!(
        name = %host.name,
        lib_path = ?args.lib_path,
        policy = ?args.policy,
        secure = args.secure,
        "starting node host"
    );

    let workdir = std::env::current_dir()?;
    let engine = Arc::new(ScratchEngine::new());
    let controller = NodeController::start(engine, workdir).await?;
    let server = NodeServer::bind(controller.clone(), "127.0.0.1:0").await?;
    let addr = server.local_addr()?;

    install_shutdown_handler(controller.shutdown_token());

    let published = match host
        .hostname_override(args)
        .map(|h| format!("{h}:{}", addr.port()))
    {
        Some(address) => address,
        None => addr.to_string(),
    };
    let registry = host.registry.clone().map(FsDirectory::new);
    match &registry {
        Some(directory) => directory.publish(&host.name, &published).await?,
        None => tracing::warn!(%addr, "no registry configured, address not published"),
    }

    tracing::info!(name = %host.name, address = %published, "node host ready");
    server.serve().await?;

    if let Some(directory) = &registry {
        let _ = directory.unpublish(&host.name).await;
    }
    tracing::info!("node host exiting");
    Ok(())
}

impl HostArgs {
    fn hostname_override<'a>(&self, args: &'a Args) -> Option<&'a str> {
        args.hostname.as_deref().filter(|h| !h.is_empty())
    }
}

async fn resolve_node(client: &ClientArgs) -> Result<(String, RemoteNode), Box<dyn std::error::Error>> {
    let directory = FsDirectory::new(&client.registry);
    let address = directory
        .resolve(&client.name)
        .await?
        .ok_or_else(|| format!("node {:?} is not published in the registry", client.name))?;
    let node = RemoteNode::connect(&address).await?;
    Ok((address, node))
}

async fn run_ping(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let (address, node) = resolve_node(client).await?;
    let started = Instant::now();
    node.ping().await?;
    let rtt = started.elapsed();
    let platform = node.platform().await?;
    let output = PingOutput {
        name: client.name.clone(),
        address,
        rtt_ms: rtt.as_millis(),
        os_type: platform.os_type,
        version: platform.version,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run_exec(client: &ClientArgs, command: &str) -> Result<(), Box<dyn std::error::Error>> {
    let (_, node) = resolve_node(client).await?;
    let session = node.bind_client(&format!("cli-{}", Uuid::new_v4())).await?;
    let result = session.run_main_loop(command).await;
    // release the node even when evaluation failed
    if let Err(e) = node.unbind_client().await {
        eprintln!("warning: unbind failed: {e}");
    }
    println!("{}", result?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match &args.command {
        Commands::Host(host) => run_host(&args, host).await?,
        Commands::Ping(client) => run_ping(client).await?,
        Commands::Exec { client, command } => run_exec(client, command).await?,
    }

    Ok(())
}
