use anyhow::Result;
use clap::Parser;
use mcnap::backend_control::{RconBackend, ShellCommandBackend};
use mcnap::bandwidth::BandwidthMeter;
use mcnap::config::{self, Config};
use mcnap::controller::{BackendControl, Controller};
use mcnap::dispatcher::Dispatcher;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use tokio::time::{Duration, interval};

/// Hibernation proxy for Minecraft servers: listens on a public port, keeps the
/// backend process stopped while idle, and starts it on the first login attempt.
#[derive(Parser)]
#[command(name = "mcnap", version, about)]
struct Cli {
    /// Path to the config directory (contains cfg.toml and an optional server-icon.png)
    #[arg(long, default_value = "config")]
    config_dir: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let config = config::get_config_from(&cli.config_dir)?;

    if config.debug {
        log::info!("Debug mode enabled: rate logging and per-accept trace active");
    }

    let player_count = Arc::new(AtomicI64::new(0));

    if let (Some(rcon_port), Some(rcon_password)) = (config.rcon_port, config.rcon_password.clone()) {
        let backend = RconBackend::new(config.start_command.clone(), rcon_port, rcon_password);
        run_with_backend(config, cli.config_dir, player_count, backend).await
    } else {
        let backend = ShellCommandBackend::new(config.start_command.clone(), config.stop_commands.clone());
        run_with_backend(config, cli.config_dir, player_count, backend).await
    }
}

async fn run_with_backend<B: BackendControl>(
    config: Config,
    config_dir: std::path::PathBuf,
    player_count: Arc<AtomicI64>,
    backend: B,
) -> Result<()> {
    let controller = Controller::new(
        backend,
        config.expected_startup_time,
        config.idle_shutdown_delay,
        player_count.clone(),
    );
    let meter = Arc::new(BandwidthMeter::new(config.bandwidth_window));

    if config.debug {
        spawn_rate_logger(Arc::clone(&meter));
    }

    spawn_shutdown_signal_handler(Arc::clone(&controller));

    let listen_host = config.listen_host.clone();
    let listen_port = config.listen_port;
    let dispatcher = Dispatcher::new(controller, meter, config, config_dir, player_count);
    dispatcher.run(&listen_host, listen_port).await
}

/// Logs the current forwarding rate at a fixed cadence when `debug` is enabled.
fn spawn_rate_logger(meter: Arc<BandwidthMeter>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            log::debug!("Forwarding rate: {:.2} KB/s", meter.rate_kbps().await);
        }
    });
}

/// Ensures the backend is stopped when the proxy itself is asked to exit.
fn spawn_shutdown_signal_handler<B: BackendControl>(controller: Arc<Controller<B>>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Received shutdown signal, forcing backend stop...");
            controller.force_stop().await;
            std::process::exit(0);
        }
    });
}
