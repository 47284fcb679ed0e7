//! `odata-mcp-bridge`: expose one OData service as MCP tools over stdio.

mod config;
mod server;

use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use config::{BridgeConfig, Overrides};
use odata_mcp_tools::source::ODataToolSource;
use rmcp::ServiceExt as _;
use rmcp::transport::stdio;
use serde_json::Value;
use server::ODataMcpServer;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "odata-mcp-bridge", version, about = "Expose an OData service as MCP tools")]
struct Cli {
    /// YAML config file.
    #[arg(long, short, env = "ODATA_MCP_CONFIG")]
    config: Option<PathBuf>,

    /// Service root URL (overrides `baseUrl` from the config file).
    #[arg(long, env = "ODATA_MCP_BASE_URL")]
    base_url: Option<String>,

    /// Bearer token for the service (overrides `auth` from the config file).
    #[arg(long, env = "ODATA_MCP_BEARER_TOKEN", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Default per-call timeout when the config sets no `timeoutSecs`.
    #[arg(long, env = "ODATA_MCP_CALL_TIMEOUT_SECS", default_value_t = 30)]
    call_timeout_secs: u64,

    /// Log filter (e.g. `info`, `odata_mcp_tools=debug`). `RUST_LOG` wins when set.
    #[arg(long, env = "ODATA_MCP_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, value_enum, env = "ODATA_MCP_LOG_FORMAT", default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve MCP over stdin/stdout (default).
    Serve,

    /// Print the synthesized tool list as JSON and exit.
    Tools,

    /// Invoke one tool and print the result.
    Call {
        tool: String,

        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    let cfg = BridgeConfig::load(
        cli.config.as_deref(),
        Overrides {
            base_url: cli.base_url.clone(),
            bearer_token: cli.bearer_token.clone(),
        },
    )?;
    let safety = cfg.safety_policy();
    let startup_timeout = cfg.startup_timeout();
    let source = ODataToolSource::build_with_safety(
        cfg.name.clone(),
        cfg.service,
        Duration::from_secs(cli.call_timeout_secs),
        startup_timeout,
        safety,
    )
    .await
    .context("start OData tool source")?;

    match cli.cmd.unwrap_or(Command::Serve) {
        Command::Serve => serve(source).await,
        Command::Tools => {
            let tools = source.list_tools().await?;
            println!("{}", serde_json::to_string_pretty(&tools)?);
            Ok(())
        }
        Command::Call { tool, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            let result = source.call_tool(&tool, arguments).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error == Some(true) {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn serve(source: ODataToolSource) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received; shutting down");
            signal.cancel();
        }
    });

    let refresh = source.spawn_refresh(shutdown.clone());
    tracing::info!(source = source.name(), "serving MCP on stdio");

    let service = ODataMcpServer::new(source.clone())
        .serve_with_ct(stdio(), shutdown.clone())
        .await
        .context("MCP handshake")?;
    let reason = service.waiting().await?;
    tracing::info!(?reason, "MCP session ended");

    shutdown.cancel();
    source.shutdown();
    if let Some(refresh) = refresh {
        let _ = refresh.await;
    }
    Ok(())
}

/// Logs go to stderr; stdout carries the protocol.
fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
