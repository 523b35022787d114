//! BlueZ D-Bus mock service daemon.

use clap::Parser;
use std::{process::ExitCode, time::Duration};
use tokio::signal::unix::{signal, SignalKind};

use bluezoo::{Address, BusKind, Session};

#[derive(Parser, Debug)]
#[command(name = "bluezoo", about = "BlueZ D-Bus Mock Service", version)]
struct Opts {
    /// Increase verbosity; may be repeated.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Decrease verbosity; may be repeated.
    #[arg(short = 'q', long = "quiet", action = clap::ArgAction::Count)]
    quiet: u8,
    /// Use the session bus; default is the system bus.
    #[arg(long = "bus-session")]
    bus_session: bool,
    /// Power on all adapters at startup.
    #[arg(long = "auto-enable")]
    auto_enable: bool,
    /// Interval between scans in seconds.
    #[arg(long = "scan-interval", value_name = "N", default_value_t = 10)]
    scan_interval: u64,
    /// Adapter to create; the index is the position on the command line.
    #[arg(short = 'a', long = "adapter", value_name = "ADDRESS")]
    adapters: Vec<Address>,
}

fn init_logging(verbose: u8, quiet: u8) {
    const LEVELS: &[log::LevelFilter] = &[
        log::LevelFilter::Off,
        log::LevelFilter::Error,
        log::LevelFilter::Warn,
        log::LevelFilter::Info,
        log::LevelFilter::Debug,
        log::LevelFilter::Trace,
    ];
    let base = 3 + verbose as i32 - quiet as i32;
    let level = LEVELS[base.clamp(0, LEVELS.len() as i32 - 1) as usize];
    env_logger::Builder::from_default_env().filter_level(level).init();
}

async fn run(opts: Opts) -> bluezoo::Result<()> {
    let bus = if opts.bus_session { BusKind::Session } else { BusKind::System };
    let session = Session::new(bus, Duration::from_secs(opts.scan_interval)).await?;

    for (id, address) in opts.adapters.iter().enumerate() {
        session.add_adapter(id as u16, *address).await?;
    }
    if opts.auto_enable {
        session.set_all_powered(true).await;
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    log::info!("Terminating");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let opts = Opts::parse();
    init_logging(opts.verbose, opts.quiet);
    match run(opts).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}
