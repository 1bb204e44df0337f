use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;

use brickd::config::Config;
use brickd::daemon::Daemon;
use brickd::metrics::Metrics;
use brickd::reactor::Reactor;
use brickd::{bricklet, network, usb};

#[derive(Parser, Debug)]
#[command(name = "brickd")]
#[command(about = "Brick Daemon")]
struct Args {
    /// Path to config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    // RUST_LOG overrides the configured level
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .default_filter_or(config.log.level.to_filter().as_str().to_lowercase()),
    )
    .init();

    if args.check_config {
        println!("config ok");
        return Ok(());
    }

    info!("Brick Daemon starting");

    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());

    let mut reactor: Reactor<Daemon> = Reactor::new();
    let handle = reactor.handle();
    let mut daemon = Daemon::new(Arc::clone(&config), Arc::clone(&metrics), handle.clone());

    let mut ops = reactor.ops();
    network::setup_listeners(&mut daemon, &mut ops)?;
    usb::setup(&mut daemon, &mut ops)?;
    bricklet::setup_ports(&mut daemon, &mut ops)?;
    reactor.apply(ops);

    // periodic counter summary
    {
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            interval.tick().await; // skip the immediate first tick

            loop {
                interval.tick().await;
                log::debug!("metrics: {}", metrics.summary());
            }
        });
    }

    {
        let handle = handle.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate()).unwrap();

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }

            info!("Shutdown requested");
            handle.stop();
        });
    }

    info!("Brick Daemon ready");

    reactor
        .run(&mut daemon, |daemon, ops| daemon.cleanup(ops))
        .await?;

    daemon.shutdown().await;

    Ok(())
}
