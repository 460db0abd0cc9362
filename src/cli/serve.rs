//! HTTP API server command.

use clap::Args;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;

use blockjobd::access::HostAccess;
use blockjobd::api::state::ApiState;
use blockjobd::blockjob::spawn_event_worker;
use blockjobd::config::DaemonConfig;
use blockjobd::monitor::SocketMonitor;
use blockjobd::vm::Guest;
use blockjobd::{Error, Result};

/// Connect to the guest's monitor and serve the HTTP API.
#[derive(Args, Debug)]
#[command(after_long_help = "\
Jobs keep running in the emulator if the server stops; they are picked up
again on the next start.

API ENDPOINTS:
  GET    /health                        Health check
  GET    /api/v1/disks                  List disks and backing chains
  GET    /api/v1/disks/:disk            Get one disk
  GET    /api/v1/disks/:disk/job        Job progress
  POST   /api/v1/disks/:disk/pull       Start a pull job
  POST   /api/v1/disks/:disk/commit     Start a commit job
  POST   /api/v1/disks/:disk/copy       Start a copy job
  POST   /api/v1/disks/:disk/abort      Cancel or pivot the disk's job
  POST   /api/v1/disks/:disk/speed      Change the job's bandwidth

EXAMPLES:
  blockjobd serve                        Listen on the configured address
  blockjobd serve -l 127.0.0.1:9000      Override the listen address")]
pub struct ServeCmd {
    /// Address and port to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR:PORT")]
    listen: Option<String>,
}

impl ServeCmd {
    /// Run the serve command.
    pub fn run(self, config: &DaemonConfig) -> Result<()> {
        let listen = self.listen.as_deref().unwrap_or(&config.listen);
        let addr: SocketAddr = listen
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", listen, e)))?;

        let guest = start_guest(config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(Error::Io)?;

        runtime.block_on(run_server(guest, addr))
    }
}

/// Connect the monitor, start the event worker and resync job state.
fn start_guest(config: &DaemonConfig) -> Result<Arc<Guest>> {
    let (events_tx, events_rx) = mpsc::channel();
    let monitor = SocketMonitor::connect(
        &config.monitor.socket,
        config.command_timeout()?,
        events_tx,
    )?;

    let guest = Arc::new(Guest::new(
        config.guest.name.clone(),
        config.capabilities,
        Arc::new(monitor),
        Arc::new(HostAccess::new()),
        config.disks(),
    ));
    spawn_event_worker(Arc::clone(&guest), events_rx)?;

    if let Err(e) = guest.refresh_jobs() {
        tracing::warn!(guest = %guest.name(), error = %e, "failed to refresh block jobs");
    }
    tracing::info!(
        guest = %guest.name(),
        disks = config.guest.disks.len(),
        "guest attached"
    );
    Ok(guest)
}

async fn run_server(guest: Arc<Guest>, addr: SocketAddr) -> Result<()> {
    if !addr.ip().is_loopback() {
        tracing::warn!(
            address = %addr,
            "API has no authentication and is reachable from the network"
        );
    }

    let app = blockjobd::api::create_router(Arc::new(ApiState::new(guest)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(Error::Io)?;

    tracing::info!(address = %addr, "starting HTTP API server");
    println!("blockjobd API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(Error::Io)?;

    tracing::info!("HTTP API server stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
