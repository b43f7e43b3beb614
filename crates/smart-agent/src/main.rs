use std::io::{self, IsTerminal};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use smart_agent::api::{self, AppState};
use smart_agent::broker::{BrokerLink, MqttLink};
use smart_agent::config::{self, APP_NAME, AppConfig, LoggingConfig};
use smart_agent::hub::Hub;
use smart_agent::source::{EventSource, clock_event};

/// Upper bound on waiting for the broker link to send DISCONNECT at exit.
const BROKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    version,
    about = "Relays MQTT broker events to Server-Sent Events clients."
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalOpts {
    /// Config file (or directory holding config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More log output; repeat for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
    /// Log at trace level
    #[arg(long, global = true)]
    trace: bool,
    /// Emit log lines as JSON
    #[arg(long, global = true)]
    json: bool,
    /// Never colour log output
    #[arg(long = "no-color", global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the broker and serve the event stream
    Serve {
        /// Bind address (overrides server.host)
        #[arg(long)]
        host: Option<String>,
        /// Listen port (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration (defaults, file and environment merged)
    Show {
        #[arg(long, value_enum, default_value_t = ConfigFormat::Toml)]
        format: ConfigFormat,
    },
    /// Print the config file location
    Path,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ConfigFormat {
    Toml,
    Json,
    Yaml,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("Error: {err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config_file = config::config_file_path(cli.global.config.clone())?;
    let config = AppConfig::load(&config_file)?;
    init_logging(&cli.global, &config.logging)?;
    debug!(path = %config_file.display(), "Configuration loaded");

    match cli.command {
        Command::Serve { host, port } => serve(config, host, port),
        Command::Init { force } => init(&config_file, force),
        Command::Config { command } => match command {
            ConfigCommand::Show { format } => show_config(&config, format),
            ConfigCommand::Path => {
                println!("{}", config_file.display());
                Ok(())
            }
        },
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

/// Install the tracing subscriber. `log` records from the library reach it
/// through the subscriber's `tracing-log` bridge.
fn init_logging(opts: &GlobalOpts, logging: &LoggingConfig) -> Result<()> {
    let level = log_level(opts, logging);
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::builder()
            .with_default_directive(LevelFilter::WARN.into())
            .parse(format!(
                "smart_agent={level},tower_http={level},rumqttc={}",
                level.min(LevelFilter::WARN)
            ))
            .context("building log filter")?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = if opts.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
            .try_init()
    } else {
        let ansi = !opts.no_color
            && std::env::var_os("NO_COLOR").is_none()
            && io::stderr().is_terminal();
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(io::stderr)
                    .with_ansi(ansi),
            )
            .try_init()
    };
    installed.context("installing log subscriber")
}

/// Flags win over `logging.level`; `-q` beats everything.
fn log_level(opts: &GlobalOpts, logging: &LoggingConfig) -> LevelFilter {
    if opts.quiet {
        return LevelFilter::ERROR;
    }
    if opts.trace || opts.verbose >= 2 {
        return LevelFilter::TRACE;
    }
    if opts.debug || opts.verbose == 1 {
        return LevelFilter::DEBUG;
    }
    logging.level.parse().unwrap_or(LevelFilter::INFO)
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists (pass --force to overwrite)",
            path.display()
        );
    }
    config::write_default_config(path)?;
    info!("Wrote default configuration to {}", path.display());
    Ok(())
}

fn show_config(config: &AppConfig, format: ConfigFormat) -> Result<()> {
    let text = match format {
        ConfigFormat::Toml => toml::to_string_pretty(config).context("rendering TOML")?,
        ConfigFormat::Json => serde_json::to_string_pretty(config).context("rendering JSON")?,
        ConfigFormat::Yaml => serde_yaml::to_string(config).context("rendering YAML")?,
    };
    println!("{}", text.trim_end());
    Ok(())
}

#[tokio::main]
async fn serve(config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<()> {
    let shutdown = CancellationToken::new();

    let (hub, notices) = Hub::spawn(&config.hub);
    info!(hub = %hub.id(), "Agent starting");

    // Nothing to relay without a broker: a failed first connect ends the process.
    let (link, inbound, broker_driver) = MqttLink::connect(&config.broker, shutdown.clone())
        .await
        .with_context(|| {
            format!(
                "connecting to MQTT broker at {}:{}",
                config.broker.host, config.broker.port
            )
        })?;
    let link: Arc<dyn BrokerLink> = Arc::new(link);

    let source = EventSource::new(hub.clone(), link);
    let routing = source.clone().spawn(inbound, notices, shutdown.clone());

    if config.events.announce_on_start {
        source.notify(clock_event()).await;
    }
    if config.events.clock_interval_secs > 0 {
        let every = Duration::from_secs(config.events.clock_interval_secs);
        source.clone().spawn_clock(every, shutdown.clone());
    }

    let app = api::create_router(AppState::new(source, shutdown.clone()), &config.server);

    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    let listener = bind(&host, port).await?;
    info!(
        "Streaming events on http://{}{}",
        listener.local_addr().context("reading bound address")?,
        config.server.stream_path
    );

    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutdown requested, closing streams");
            stop.cancel();
        })
        .await
        .context("serving HTTP")?;

    // Make sure the broker hears DISCONNECT before the runtime goes away.
    shutdown.cancel();
    match tokio::time::timeout(BROKER_SHUTDOWN_TIMEOUT, broker_driver).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!("Broker driver task failed: {err}"),
        Err(_) => warn!("Broker link did not stop within {BROKER_SHUTDOWN_TIMEOUT:?}"),
    }
    if let Err(err) = routing.await {
        warn!("Event routing task failed: {err}");
    }

    info!("Stopped");
    Ok(())
}

async fn bind(host: &str, port: u16) -> Result<TcpListener> {
    let listener = match format!("{host}:{port}").parse::<SocketAddr>() {
        Ok(addr) => TcpListener::bind(addr).await,
        // Names such as "localhost" go through the resolver.
        Err(_) => TcpListener::bind((host, port)).await,
    };
    listener.with_context(|| format!("binding HTTP listener to {host}:{port}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Cannot listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
