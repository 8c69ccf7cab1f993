//! VM Cluster Manager CLI
//!
//! Inspects a cluster config and runs opcodes against a simulated fleet
//! mirroring it. Operations run on an in-memory copy of the config; the
//! file on disk is only read.

use clap::{Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vm_cluster_manager::controlplane::backends::DEFAULT_RPC_TIMEOUT;
use vm_cluster_manager::{
    required_free_space, BackendFactory, ConfigStore, Context, DiskTemplate, Error, LogFeedback,
    OpCode, OpResult, Processor, Result, SimNodeSpec, SyncPolicy,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// VM Cluster Manager - control plane for replicated virtual machine storage
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster config file
    #[arg(long, env = "VMCLUSTER_CONFIG", default_value = "/var/lib/vmcluster/config.data")]
    config: PathBuf,

    /// Name of the node this command runs on (defaults to the master)
    #[arg(long, env = "VMCLUSTER_NODE")]
    node: Option<String>,

    /// Deadline for every node RPC, in seconds
    #[arg(long, env = "VMCLUSTER_RPC_TIMEOUT", default_value_t = DEFAULT_RPC_TIMEOUT.as_secs())]
    rpc_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cluster config
    Show,

    /// Verify the cluster
    Verify,

    /// Run one JSON opcode (read from a file, or stdin when omitted)
    Submit {
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Free volume group space a new instance needs on each of its nodes
    DiskSize {
        #[arg(long)]
        template: String,
        /// Data disk size in MiB
        #[arg(long)]
        disk_size: u64,
        /// Swap disk size in MiB
        #[arg(long, default_value_t = 4096)]
        swap_size: u64,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("VM Cluster Manager {}", vm_cluster_manager::VERSION);

    match &args.command {
        Command::DiskSize {
            template,
            disk_size,
            swap_size,
        } => {
            let template: DiskTemplate = template.parse()?;
            println!("{}", required_free_space(template, *disk_size, *swap_size));
            Ok(())
        }
        Command::Show => {
            let store = ConfigStore::open(&args.config)?;
            println!("{}", serde_json::to_string_pretty(&store.snapshot())?);
            Ok(())
        }
        Command::Verify => {
            let processor = build_processor(&args)?;
            let result = processor.submit_json(r#"{"op":"cluster_verify"}"#, &LogFeedback).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if let OpResult::Verify(report) = result {
                if report.bad {
                    warn!("Cluster verification found {} problems", report.findings.len());
                    std::process::exit(1);
                }
            }
            Ok(())
        }
        Command::Submit { file } => {
            let raw = match file {
                Some(path) => std::fs::read_to_string(path)?,
                None => {
                    let mut raw = String::new();
                    std::io::stdin().read_to_string(&mut raw)?;
                    raw
                }
            };
            let op = OpCode::from_json(&raw)?;
            info!("Submitting {}", op.name());

            let processor = build_processor(&args)?;
            let result = processor.submit(op, &LogFeedback).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
    }
}

/// Processor over an in-memory copy of the config and a fleet mirroring it
fn build_processor(args: &Args) -> Result<Processor> {
    let on_disk = ConfigStore::open(&args.config)?;
    let config = on_disk.snapshot();
    if !config.is_initialized() {
        return Err(Error::Configuration(format!(
            "{} does not describe an initialized cluster",
            args.config.display()
        )));
    }

    let local = args.node.clone().unwrap_or_else(|| config.master_node.clone());
    let rpc = BackendFactory::simulated(
        &config,
        &SimNodeSpec::default(),
        Some(Duration::from_secs(args.rpc_timeout)),
    );
    let ctx = Context::new(ConfigStore::new(config), rpc, SyncPolicy::default());
    Ok(Processor::new(ctx, local))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // logs go to stderr so stdout stays machine-readable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
