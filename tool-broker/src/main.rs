//! `tool-broker` binary.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::sync::watch;
use tool_broker::config::{AgentTransport, BrokerConfig, ConfigLoader};
use tool_broker::transport::stdio_channel;
use tracing::{error, info};

const EXIT_STARTUP: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Blocking stdin reads can outlive the agent session; don't wait for them.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TransportArg {
    Stdio,
    Tcp,
}

impl From<TransportArg> for AgentTransport {
    fn from(value: TransportArg) -> Self {
        match value {
            TransportArg::Stdio => Self::Stdio,
            TransportArg::Tcp => Self::Tcp,
        }
    }
}

/// Routes agent tool calls to connected app processes.
#[derive(Debug, Parser)]
#[command(name = "tool-broker", version, about)]
struct Cli {
    /// Agent transport, overriding `agent.transport`.
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Configuration file (TOML).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// App listener address, overriding `listener.bind`.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Per-call timeout in milliseconds, overriding `calls.default_timeout_ms`.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log filter directive, overriding `logging.level`.
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("tool-broker: {err:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(err) = tool_broker::telemetry::init(&config.logging) {
        eprintln!("tool-broker: {err}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "failed to start async runtime");
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let outcome = runtime.block_on(serve(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "broker stopped");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

fn load_config(cli: &Cli) -> Result<BrokerConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }

    let mut config = loader.extract().context("loading configuration")?;
    if let Some(transport) = cli.transport {
        config.agent.transport = transport.into();
    }
    if let Some(listen) = &cli.listen {
        config.listener.bind.clone_from(listen);
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.calls.default_timeout_ms = timeout_ms;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }

    config.validate().context("validating configuration")?;
    Ok(config)
}

async fn serve(config: BrokerConfig) -> Result<()> {
    let broker = tool_broker::broker_from_config(&config)?;
    let apps = broker
        .bind_apps(&config.listener.bind)
        .await
        .context("binding app listener")?;

    let (stop, mut stopped) = watch::channel(false);
    let app_server = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .serve_apps(apps, async move {
                    let _ = stopped.changed().await;
                })
                .await;
        })
    };

    match config.agent.transport {
        AgentTransport::Stdio => {
            info!("serving agent on stdio");
            let (sink, source) = stdio_channel(config.listener.max_frame_bytes);
            tokio::select! {
                () = broker.serve_agent(sink, source) => info!("agent input closed; shutting down"),
                () = interrupted() => info!("interrupt received; shutting down"),
            }
        }
        AgentTransport::Tcp => {
            let agents = broker
                .bind_agents(&config.agent.bind)
                .await
                .context("binding agent listener")?;
            broker.serve_agents(agents, interrupted()).await;
            info!("interrupt received; shutting down");
        }
    }

    let _ = stop.send(true);
    let _ = app_server.await;
    Ok(())
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "failed to listen for interrupt; running until input closes");
        std::future::pending::<()>().await;
    }
}
