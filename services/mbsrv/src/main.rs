//! Modbus ingestion service (`mbsrv`)
//!
//! Opens every configured TCP listener and serial port and logs each request that reaches
//! the dispatch queue.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info, warn};

use mbsrv::config::MbsrvConfig;
use mbsrv::logging::init_logging;
use mbsrv::observer::{Observer, TransportEvent};
use mbsrv::server::Server;
use mbsrv::RequestReceiver;

/// Command-line arguments for mbsrv
#[derive(Parser, Debug, Clone)]
#[command(
    name = "mbsrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Modbus TCP/RTU ingestion service",
    long_about = None
)]
struct Args {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long, env = "MBSRV_CONFIG", default_value = "config/mbsrv.yaml")]
    config: PathBuf,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Validation mode - only validate configuration without starting service
    #[arg(long)]
    validate: bool,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,
}

fn load_config(args: &Args) -> anyhow::Result<MbsrvConfig> {
    let mut config = if args.config.exists() {
        MbsrvConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load {}", args.config.display()))?
    } else {
        MbsrvConfig::from_env().context("Failed to load configuration from environment")?
    };

    if let Some(level) = &args.log_level {
        config.service.log.level = level.clone();
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn event_logger() -> Observer {
    Arc::new(|event: &TransportEvent| match event {
        TransportEvent::BindFailed { .. }
        | TransportEvent::AcceptFailed { .. }
        | TransportEvent::PortFailed { .. } => error!("Transport event: {}", event),
        TransportEvent::FrameRejected { .. } => warn!("Transport event: {}", event),
        _ => info!("Transport event: {}", event),
    })
}

/// Log every request until `shutdown` resolves or the queue closes
///
/// `shutdown` is polled from one pinned future for the whole loop, so a signal that fires
/// while a request is being logged is seen on the next iteration.
async fn drain_requests<F>(requests: &mut RequestReceiver, shutdown: F) -> usize
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut handled = 0;

    loop {
        tokio::select! {
            request = requests.recv() => match request {
                Some(request) => {
                    let frame = request.frame();
                    info!(
                        "Request from {}: unit {} function 0x{:02X} data {}",
                        request.peer(),
                        frame.unit_id(),
                        frame.function(),
                        hex::encode(frame.data())
                    );
                    handled += 1;
                },
                None => break,
            },
            _ = &mut shutdown => break,
        }
    }

    handled
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.service.log, &config.service.name)?;

    if args.validate {
        info!("Validation completed successfully");
        return Ok(());
    }

    info!(
        "Starting {} v{} ({} TCP listener(s), {} serial port(s))",
        config.service.name,
        env!("CARGO_PKG_VERSION"),
        config.tcp.len(),
        config.serial.len()
    );

    let (server, mut requests) = Server::new(&config.ingest);
    let mut server = server.with_observer(event_logger());

    for listener in &config.tcp {
        if let Err(e) = server.listen_tcp(listener).await {
            error!("Skipping TCP listener {}: {}", listener.address, e);
        }
    }
    for port in &config.serial {
        if let Err(e) = server.listen_rtu(port) {
            error!("Skipping serial port {}: {}", port.device, e);
        }
    }

    if server.listeners().is_empty() && server.ports().is_empty() {
        bail!("No transport could be opened");
    }

    let handled = drain_requests(&mut requests, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        info!("Shutdown signal received");
    })
    .await;
    info!("Handled {} request(s)", handled);

    server.shutdown();
    info!("{} stopped", config.service.name);
    Ok(())
}
