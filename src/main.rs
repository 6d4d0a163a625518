use clap::Parser;
use color_eyre::Result;
use harness_keel::{cli, config::Config, logging, server, station::Station};
use tracing::{debug, info, Level};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                debug!(%e, "No hangup signal, only Ctrl-C");
                let _ = tokio::signal::ctrl_c().await;
                info!("Ctrl-C, quitting");
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Ctrl-C, quitting"),
            _ = hangup.recv() => info!("Told to hang up, quitting"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl-C, quitting");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();

    if let Some(command) = cli.command {
        cli::handle_command(command);

        return Ok(());
    }

    logging::init(Level::INFO, cli.log_dir.map(|dir| (Level::DEBUG, dir))).await;

    let config = if let Some(config_path) = cli.config {
        debug!(?config_path, "Config from path");
        Config::new_from_path(config_path)?
    } else {
        debug!("Default config");
        Config::default()
    };

    let station = Station::new(config).await?;

    // The station goes down before the server drains its connections,
    // otherwise open event streams and waits would keep the drain from finishing.
    let stopping = station.clone();
    let shutdown = async move {
        shutdown_signal().await;
        stopping.shutdown().await;
    };

    server::serve(station, Some(cli.port), None, shutdown).await?;
    logging::shutdown();

    Ok(())
}
