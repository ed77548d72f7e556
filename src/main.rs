use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use dahua_twilight::clock::SharedClock;
use dahua_twilight::config::Config;
use dahua_twilight::discovery::Discovery;
use dahua_twilight::orchestrator::Orchestrator;

/// twilightd — keeps Dahua camera day/night schedules aligned with
/// astronomical twilight.
///
/// Runs on the camera LAN with no internet, DNS, or trustworthy local
/// clock: peers are learned from broadcast discovery, true time from the
/// NVR over SNTP. Once per civil day the current sunrise/sunset window is
/// written to each camera's image-profile schedule; during polar day or
/// night a full-time profile is pinned instead.
#[derive(Parser)]
#[command(name = "twilightd", version, about, long_about = None)]
struct Cli {
    /// Config file path. Defaults to twilightd.toml in the user config dir.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Parse and validate the config, print a summary, and exit.
    #[arg(long)]
    check_config: bool,

    /// Run a single reconcile cycle and exit instead of daemonizing.
    #[arg(long)]
    once: bool,

    /// Log filter override (e.g. "debug", "dahua_twilight=trace").
    #[arg(long)]
    log_level: Option<String>,
}

/// Corrected-time timestamps once the clock is valid, monotonic uptime
/// before that.
struct ClockTimer {
    clock: SharedClock,
    started: std::time::Instant,
}

impl FormatTime for ClockTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        match self.clock.try_now() {
            Some(now) => write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(w, "+{:.3}s", self.started.elapsed().as_secs_f64()),
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("twilightd: {}", error);
            return ExitCode::from(2);
        }
    };

    if cli.check_config {
        print!("{}", config);
        return ExitCode::SUCCESS;
    }

    let clock = SharedClock::new();
    let filter_spec = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.log_level.clone());
    let filter = EnvFilter::try_new(&filter_spec).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_timer(ClockTimer {
            clock: clock.clone(),
            started: std::time::Instant::now(),
        })
        .init();

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    runtime.block_on(run(config, clock, cli.once))
}

async fn run(config: Config, clock: SharedClock, once: bool) -> ExitCode {
    let cancel = CancellationToken::new();

    let discovery = match Discovery::start(&config.listen_interfaces, cancel.clone()) {
        Ok(discovery) => discovery,
        Err(error) => {
            error!(%error, "cannot start discovery");
            return ExitCode::FAILURE;
        }
    };
    info!(
        sockets = discovery.local_addrs().len(),
        cameras = config.cameras.len(),
        "twilightd {} listening",
        env!("CARGO_PKG_VERSION")
    );

    let orchestrator = Orchestrator::new(Arc::new(config), discovery, clock, cancel.clone());
    let trigger = orchestrator.manual_trigger();

    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("sigterm handler");
        let mut sighup = signal(SignalKind::hangup()).expect("sighup handler");
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt, shutting down");
                    signal_cancel.cancel();
                }
                _ = sigterm.recv() => {
                    info!("terminated, shutting down");
                    signal_cancel.cancel();
                }
                _ = sighup.recv() => {
                    info!("SIGHUP, waking the reconcile loop");
                    trigger.notify_waiters();
                }
            }
        }
    });

    orchestrator.run(once).await;
    cancel.cancel();
    info!("clean shutdown");
    ExitCode::SUCCESS
}
