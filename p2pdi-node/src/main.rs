// P2P-DI node: run the registration service or a peer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use p2pdi_node::{config, Config, DirectorySource, PeerAgent, PeerError, RegistrationService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: p2pdi-node <registry|peer> [--version]";

enum Mode {
    Registry,
    Peer,
}

fn main() -> anyhow::Result<()> {
    let mut mode = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("p2pdi-node {}", VERSION);
                return Ok(());
            }
            "registry" => mode = Some(Mode::Registry),
            "peer" => mode = Some(Mode::Peer),
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }
    let Some(mode) = mode else {
        bail!(USAGE);
    };

    let cfg = config::load().context("loading configuration")?;
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match mode {
            Mode::Registry => run_registry(&cfg).await,
            Mode::Peer => run_peer(&cfg).await,
        }
    })
}

async fn run_registry(cfg: &Config) -> anyhow::Result<()> {
    let addr = cfg.registry_addr();
    let (_service, handle) = RegistrationService::start(&addr, cfg.registry_options())
        .await
        .with_context(|| format!("starting registration service on {addr}"))?;
    shutdown_signal().await?;
    info!("shutting down");
    handle.stop();
    handle.join().await;
    Ok(())
}

async fn run_peer(cfg: &Config) -> anyhow::Result<()> {
    let source = DirectorySource::new(&cfg.document_dir);
    let found = source
        .ids()
        .with_context(|| format!("scanning {}", cfg.document_dir.display()))?;
    let options = cfg.peer_options(&found);
    let mut peer = PeerAgent::start(options, found, Arc::new(source))
        .await
        .context("starting peer")?;
    info!(id = %peer.id(), "peer started with {} documents", peer.held().len());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    tokio::select! {
        result = peer.reconcile() => match result {
            Ok(report) => info!(
                rounds = report.rounds,
                "fetched {} documents in {:?}",
                report.fetched.len(),
                report.total
            ),
            Err(e @ PeerError::Critical(_)) => {
                peer.stop().await;
                return Err(e).context("reconciliation aborted");
            }
            Err(e) => warn!("reconciliation ended: {e}"),
        },
        signal = &mut shutdown => {
            signal?;
            return leave(&mut peer).await;
        }
    }

    // Keep serving until shut down; renew the lease as it comes due.
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.tick_interval_secs.max(1)));
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal?;
                break;
            }
            _ = ticker.tick() => {
                if peer.keep_alive_due() {
                    if let Err(e) = peer.keep_alive().await {
                        warn!("keep-alive failed: {e}");
                    }
                }
            }
        }
    }
    leave(&mut peer).await
}

async fn leave(peer: &mut PeerAgent) -> anyhow::Result<()> {
    info!("leaving");
    if let Err(e) = peer.leave().await {
        warn!("leave failed: {e}");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
