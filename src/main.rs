use std::{
    io::{self, Write},
    process::ExitCode,
    time::Duration,
};

use clap::{builder::RangedU64ValueParser, Args, Parser, Subcommand};
use sysd_watch::{build_watcher, config::Config, logging, HostnameMethod, WatchError, WatchMode};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "sysd-watch")]
#[command(about = "Stream property changes of systemd units as JSON lines")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch unit properties on a fixed interval
    Poll(WatchArgs),
    /// Relay property changes pushed by systemd
    Sub(WatchArgs),
}

#[derive(Args)]
struct WatchArgs {
    /// Units to watch, e.g. "sshd,docker.socket"
    #[arg(short = 'w', long = "watchlist", value_delimiter = ',')]
    watch_list: Vec<String>,

    /// Hostname method: OS, FQDN, RFQDN, CMD or ENV
    #[arg(short = 'n', long = "hostnamemethod")]
    hostname_method: Option<HostnameMethod>,

    /// Capacity of the event and error channels
    #[arg(
        short = 'm',
        long = "metricbufferlimit",
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    metrics_buffer_limit: Option<usize>,

    /// Seconds between polls
    #[arg(
        short = 'p',
        long = "interval",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    poll_interval: Option<u64>,
}

impl WatchArgs {
    fn apply(self, mut config: Config) -> Config {
        if !self.watch_list.is_empty() {
            config.units = self.watch_list;
        }
        if let Some(method) = self.hostname_method {
            config.hostname_method = method;
        }
        if let Some(limit) = self.metrics_buffer_limit {
            config.metrics_buffer_limit = limit;
        }
        if let Some(secs) = self.poll_interval {
            config.poll_interval = Duration::from_secs(secs);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    logging::init_logging();

    let cli = Cli::parse();
    let (mode, args) = match cli.command {
        Command::Poll(args) => (WatchMode::Poll, args),
        Command::Sub(args) => (WatchMode::Subscribe, args),
    };
    let config = args.apply(Config::from_env()?);

    info!(
        mode = ?mode,
        units = ?config.units,
        hostname_method = %config.hostname_method,
        "sysd-watch starting"
    );

    let cancel = CancellationToken::new();
    let mut handle = build_watcher(&config).start(mode, cancel.clone());

    let shutdown = signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut events_open = true;
    let mut errors_open = true;
    let mut last_error = None;
    while events_open || errors_open {
        tokio::select! {
            result = &mut shutdown => {
                result?;
                info!("interrupted, stopping watch loop");
                cancel.cancel();
                handle.task.await?;
                return Ok(ExitCode::SUCCESS);
            }
            event = handle.events.recv(), if events_open => match event {
                Some(event) => {
                    let line = serde_json::to_string(&event)?;
                    writeln!(io::stdout().lock(), "{line}")?;
                }
                None => events_open = false,
            },
            err = handle.errors.recv(), if errors_open => match err {
                Some(err) => {
                    error!(error = %err, "watch error");
                    last_error = Some(err);
                }
                None => errors_open = false,
            },
        }
    }

    handle.task.await?;
    error!("watch loop ended");
    Ok(ExitCode::from(exit_status(last_error.as_ref())))
}

/// 2 when the watch list was rejected, 1 for any other early stop.
fn exit_status(last_error: Option<&WatchError>) -> u8 {
    match last_error {
        Some(err) if err.is_configuration() => 2,
        _ => 1,
    }
}
