use std::{env, process::exit, time::Duration};

use thlink_core::TunnelHooks;
use thlink_proto::TUNNEL_VERSION;
use tokio::task::LocalSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    args::{ArgumentsRequest, StartupArguments},
    control::ClientError,
};

mod args;
mod control;

/// Brokers slower than this are not worth listing during auto-selection.
const AUTO_SELECT_CUTOFF: Duration = Duration::from_millis(200);

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'thlink-client --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    let default_level = if startup_args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        error!("client finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<(), ClientError> {
    if startup_args.plugin != 0 {
        return Err(ClientError::NoSuchPlugin(startup_args.plugin));
    }

    let server = if startup_args.auto_select {
        auto_select_broker(&startup_args.server).await?
    } else {
        startup_args.server.clone()
    };

    info!("will connect to local port {}", startup_args.local_port);
    info!("will connect to broker address {server}");

    let delay = control::average_ping(&server).await;
    info!("delay {:.3}ms", delay.as_secs_f64() * 1000.0);

    match control::broker_version(&server).await {
        Ok((code, version)) => {
            info!("broker version {version}");
            if code != TUNNEL_VERSION {
                warn!("tunnel version mismatch: broker speaks {code}, this client speaks {TUNNEL_VERSION}");
            }
        }
        Err(error) => warn!("broker version query failed: {error}"),
    }

    info!("ask for new udp tunnel");
    let mut client = control::connect(startup_args.local_port, &server, startup_args.stream_protocol).await?;
    info!("tunnel established for remote {}:{}", client.server_ip(), client.udp_port());

    client.serve(TunnelHooks::new()).await?;
    info!("tunnel finished with status {:?}", client.status());
    Ok(())
}

/// Surveys the federation reachable through `seed` and picks the
/// lowest-latency broker, listing the closest candidates.
async fn auto_select_broker(seed: &str) -> Result<String, ClientError> {
    println!("Surveying brokers known to {seed}...");

    let mut delays = control::net_broker_delay(seed).await?;
    delays.insert(seed.to_string(), control::average_ping(seed).await);

    let mut entries: Vec<(String, Duration)> = delays.into_iter().collect();
    entries.sort_by_key(|(_, delay)| *delay);

    for (address, delay) in entries.iter().take(5).filter(|(_, delay)| *delay < AUTO_SELECT_CUTOFF) {
        println!("  {address}  {:.3} ms", delay.as_secs_f64() * 1000.0);
    }

    match entries.into_iter().next() {
        Some((address, _)) => {
            println!("Selected {address}");
            Ok(address)
        }
        None => Ok(seed.to_string()),
    }
}
