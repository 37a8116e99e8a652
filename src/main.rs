use clap::Parser;
use docker_socket_authorizer::*;
use miette::{IntoDiagnostic, Result};

#[derive(Parser, Debug)]
#[command(
    name = "docker-socket-authorizer",
    version,
    about = "Out-of-band authorization for the Docker control socket"
)]
struct Cli {
    /// Path to configuration file (overrides the default search locations)
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Parser, Debug)]
enum Command {
    /// Print a built-in source (or an empty input record) and exit
    Introspect {
        #[arg(value_parser = ["query", "meta-policy", "input"])]
        what: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Introspect { what }) = cli.command {
        match what.as_str() {
            "query" => print!("{}", policy::meta::QUERY),
            "meta-policy" => print!("{}", policy::meta::META_POLICY),
            _ => println!(
                "{}",
                serde_json::to_string_pretty(&input::Input::default()).into_diagnostic()?
            ),
        }
        return Ok(());
    }

    settings::initialize(cli.config);
    // The logger cannot be configured before the configuration is read, so a
    // config failure is held on to and logged once some logger is up.
    let (cfg, load_error) = match settings::load() {
        Ok(cfg) => (cfg, None),
        Err(error) => (settings::fall_back_to_defaults(), Some(error)),
    };
    let logger_error = logging::configure_logger().err();
    if let Some(error) = load_error {
        tracing::warn!(%error, "Unable to load configuration file; continuing with defaults");
    }
    if let Some(error) = logger_error {
        tracing::error!(%error, "Logger configuration failed, continuing with defaults");
    }

    shutdown::on_shutdown("log file", logging::close_log_file);
    initialize_signal_handler();

    if let Err(error) = policy::loader::load_policies().await {
        tracing::error!(%error, "Unable to initialize policies");
        std::process::exit(1);
    }

    if cfg.policy.watch_directories {
        match policy::watcher::watch_policies() {
            Ok(watcher) => {
                policy::watcher::swap_active(&None, Some(watcher));
                shutdown::on_shutdown("policy watcher", || {
                    if let Some(watcher) = policy::watcher::active() {
                        watcher.close();
                    }
                });
            }
            Err(error) => {
                // The daemon still serves; only automatic reloads are lost.
                tracing::error!(%error, "Unable to establish policy watcher");
            }
        }
    }

    if let Err(error) = web::initialize_metrics_server(&cfg).await {
        tracing::error!(%error, "Unable to initialize metrics");
        std::process::exit(1);
    }

    if let Err(error) = web::initialize_auth_server(&cfg).await {
        tracing::error!(%error, "Unable to initialize authorization server");
        std::process::exit(1);
    }

    shutdown::wait_for_shutdown().await;
    Ok(())
}

fn initialize_signal_handler() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "Unable to install SIGINT handler");
            return;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "Unable to install SIGTERM handler");
            return;
        }
    };
    let mut quit = match signal(SignalKind::quit()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "Unable to install SIGQUIT handler");
            return;
        }
    };
    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "Unable to install SIGHUP handler");
            return;
        }
    };

    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
                _ = quit.recv() => "SIGQUIT",
                _ = hangup.recv() => {
                    tracing::info!("SIGHUP is not currently supported but eventually may cause config reloads");
                    continue;
                }
            };
            tracing::info!(signal = name, "Signal received");
            let _ = shutdown::shutdown("signal", tracing::Level::INFO);
        }
    });
}
