use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use toolgate_gateway::Gateway;
use toolgate_registry::ConfigStore;

#[derive(Parser)]
#[command(name = "toolgate")]
#[command(about = "Expose a directory of local scripts as sandboxed, callable tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory scanned for tool scripts
    #[arg(long, global = true, default_value = "tools")]
    tools_dir: PathBuf,

    /// Directory holding global.json, overrides.json and the per-tool files
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    /// Force debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the tools directory and update the tool registry
    Discover {
        /// Rescan even if nothing changed since the last discovery
        #[arg(long)]
        full: bool,
    },
    /// Print the descriptors of all enabled tools as JSON
    List,
    /// Call a tool and print its result envelope
    Call {
        name: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Add "confirm": true to the arguments
        #[arg(long)]
        confirm: bool,
    },
    /// Write tools.json from the per-tool configuration files
    BuildTools,
    /// Split a legacy tools.json into per-tool configuration files
    Migrate,
    /// Enable a tool
    Enable { name: String },
    /// Disable a tool
    Disable { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let store = ConfigStore::new(&cli.config_dir);
    let config = store
        .load_global()
        .with_context(|| format!("failed to load config from {}", cli.config_dir.display()))?;
    init_subscriber(&config.log_level, cli.debug);
    tracing::debug!(
        tools_dir = %cli.tools_dir.display(),
        config_dir = %cli.config_dir.display(),
        "starting"
    );

    let gateway = Gateway::open(&cli.tools_dir, &cli.config_dir)
        .await
        .context("failed to start gateway")?;

    match cli.command {
        Command::Discover { full } => {
            let report = gateway
                .rediscover(full)
                .await
                .context("discovery failed")?;
            if report.full_scan {
                println!(
                    "Discovered {} tools ({} new, {} updated, {} disabled left untouched)",
                    report.tools.len(),
                    report.added.len(),
                    report.updated.len(),
                    report.skipped_disabled.len()
                );
            } else {
                println!("No changes, {} tools registered", report.tools.len());
            }
        }
        Command::List => {
            let tools = gateway.list_tools();
            println!("{}", serde_json::to_string_pretty(&tools)?);
        }
        Command::Call {
            name,
            args,
            confirm,
        } => {
            let arguments = parse_arguments(&args, confirm)?;
            let envelope = gateway.call_tool(&name, &arguments).await;
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if envelope["status"] != "success" {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::BuildTools => {
            let count = gateway
                .build_compiled_registry()
                .context("failed to build tools.json")?;
            println!("Wrote {count} tools to tools.json");
        }
        Command::Migrate => {
            let count = gateway
                .migrate_legacy()
                .context("failed to migrate tools.json")?;
            println!("Migrated {count} tools");
        }
        Command::Enable { name } => {
            gateway
                .set_tool_enabled(&name, true)
                .await
                .with_context(|| format!("failed to enable {name}"))?;
            println!("Enabled {name}");
        }
        Command::Disable { name } => {
            gateway
                .set_tool_enabled(&name, false)
                .await
                .with_context(|| format!("failed to disable {name}"))?;
            println!("Disabled {name}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn parse_arguments(raw: &str, confirm: bool) -> anyhow::Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    let Value::Object(mut arguments) = value else {
        bail!("--args must be a JSON object");
    };
    if confirm {
        arguments.insert("confirm".into(), Value::Bool(true));
    }
    Ok(arguments)
}

/// Logs go to stderr so stdout carries only command output.
fn init_subscriber(log_level: &str, debug: bool) {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level))
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
