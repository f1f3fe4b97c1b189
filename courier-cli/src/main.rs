//! Courier CLI

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use courier_config::{load_config, ScriptingSettings};
use courier_scripting::{HostValue, PostResponseContext, ScriptOrchestrator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Courier workspace scripting", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "courier.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the configuration, start the engines and report diagnostics
    Check {
        /// Workspace to activate instead of the configured one
        #[arg(short, long)]
        workspace: Option<String>,
    },

    /// Call a script and print its result as JSON
    Call {
        /// Script name
        script: String,

        /// Workspace the script is resolved from (root scripts when omitted)
        #[arg(short, long)]
        workspace: Option<String>,

        /// Arguments, parsed as JSON when possible and passed as text otherwise
        args: Vec<String>,
    },

    /// Run the post-response chain of a workspace over a body
    Respond {
        /// Workspace name
        workspace: String,

        /// Request name
        #[arg(short, long)]
        request: Option<String>,

        /// Response body
        body: String,
    },

    /// Precompile namespaces, scripts and handler chains
    Warmup {
        /// Maximum number of scripts to compile
        #[arg(long, default_value_t = 256)]
        limit: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    match cli.command {
        Commands::Check { workspace } => {
            let orchestrator = start(&cli.config)?;
            if let Some(workspace) = &workspace {
                orchestrator.activate_workspace(workspace)?;
            }

            let config = orchestrator.config();
            println!("Workspaces: {}", config.workspaces.len());
            println!("Root scripts: {}", config.scripts.len());
            println!("Native engine: {}", if orchestrator.native_enabled() { "on" } else { "off" });

            let diagnostics = orchestrator.diagnostics();
            if diagnostics.is_empty() {
                println!("✓ No diagnostics");
                return Ok(());
            }
            for diagnostic in &diagnostics {
                println!("  {diagnostic}");
            }
            println!("✗ {} diagnostic(s)", diagnostics.len());
            std::process::exit(1);
        }

        Commands::Call { script, workspace, args } => {
            let orchestrator = start(&cli.config)?;
            let args = args.iter().map(|arg| parse_arg(arg)).collect();
            let result = orchestrator
                .call_script(workspace.as_deref(), &script, args)
                .with_context(|| format!("calling script '{script}'"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }

        Commands::Respond { workspace, request, body } => {
            let orchestrator = start(&cli.config)?;
            let body = orchestrator.invoke_post_response(
                &workspace,
                request.as_deref(),
                &PostResponseContext::new(body),
            )?;
            println!("{body}");
            Ok(())
        }

        Commands::Warmup { limit } => {
            let orchestrator = start(&cli.config)?;
            let report = orchestrator.warmup(limit, true, true);
            println!("Namespaces: {}", report.namespaces);
            println!("Scripts compiled: {}", report.compiled);
            println!("Chains built: {}", report.chains);
            println!("Failures: {}", report.failed);
            for diagnostic in orchestrator.diagnostics() {
                println!("  {diagnostic}");
            }
            Ok(())
        }

        Commands::Version => {
            println!("Courier");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

/// Load the configuration and initialize an orchestrator over it
fn start(path: &Path) -> Result<ScriptOrchestrator> {
    tracing::info!("Config file: {}", path.display());
    let config = load_config(path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(workspaces = config.workspaces.len(), "Configuration loaded");

    let orchestrator = ScriptOrchestrator::new(Arc::new(config), ScriptingSettings::from_env());
    orchestrator.initialize()?;
    Ok(orchestrator)
}

fn parse_arg(arg: &str) -> HostValue {
    serde_json::from_str(arg).unwrap_or_else(|_| HostValue::String(arg.to_string()))
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_level(true)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(filter.into()),
        )
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg() {
        assert_eq!(parse_arg("42"), serde_json::json!(42));
        assert_eq!(parse_arg("[1,2]"), serde_json::json!([1, 2]));
        assert_eq!(parse_arg("staging"), serde_json::json!("staging"));
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::try_parse_from(["courier", "call", "lookup", "-w", "staging", "a", "1"]).unwrap();
        match cli.command {
            Commands::Call { script, workspace, args } => {
                assert_eq!(script, "lookup");
                assert_eq!(workspace.as_deref(), Some("staging"));
                assert_eq!(args, vec!["a", "1"]);
            }
            _ => panic!("expected call"),
        }
    }
}
