//! Entry point: parse arguments, load configuration, wire up storage, the
//! upstream client, the agent-facing listeners, and the local HTTP surface,
//! then run until a signal arrives.

#[macro_use]
extern crate tracing;

mod agent_acceptor;
mod backoff;
mod cert_refresh;
mod config;
mod http_api;
mod listener;
mod logging;
mod mux_http;
mod reporting;
mod reverse_proxy;
mod storage;
mod upstream_client;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use aegis_dialer::HostMatchDialer;
use aegis_peer_hub::PeerHub;
use aegis_task::ShutdownHandle;
use camino::Utf8PathBuf;
use clap::Parser;

use agent_acceptor::AgentAcceptor;
use config::ConfHandle;
use storage::memory::{MemoryAgentStore, MemoryBrokerStore, MemoryCertificateStore};

/// How often the configured-certificate table is refreshed from storage.
const CERT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Link-layer core of the aegis fleet: sits between the central server and
/// every enrolled agent, proxying the agent-facing surface over a single
/// reconnecting tunnel to the server.
#[derive(Parser, Debug)]
#[command(name = "aegis-broker", version, about, disable_version_flag = true)]
struct Args {
    /// Path to the broker's TOML configuration file.
    #[arg(short = 'c', long = "config", default_value = "broker.toml")]
    config: Utf8PathBuf,

    /// Print version information and exit, matching the original CLI's
    /// `-v` rather than clap's uppercase-only auto-derived flag.
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: (),

    /// Raise the default log level from info to debug.
    #[arg(long = "debug")]
    debug: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init(args.debug);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("failed to start tokio runtime: {error}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "broker exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let conf_handle = ConfHandle::load(&args.config)?;
    let conf = conf_handle.get();

    let (shutdown_handle, shutdown) = ShutdownHandle::new();
    tokio::spawn({
        let shutdown_handle = shutdown_handle;
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("received shutdown signal");
            shutdown_handle.signal();
        }
    });

    let agent_store = Arc::new(MemoryAgentStore::new());
    let broker_store = Arc::new(MemoryBrokerStore::new());
    let cert_store: Arc<dyn storage::CertificateStore> = Arc::new(MemoryCertificateStore::new());
    let cert_source = Arc::new(aegis_cert::CertificateSource::new());

    let upstream = upstream_client::UpstreamClient::new(conf_handle.clone(), shutdown.clone());
    let outcome = upstream.connect().await?;
    let server_muxer = outcome.muxer;
    info!("connected to upstream server");

    let hub = Arc::new(PeerHub::new(conf.agent_domain.clone()));
    let dialer = Arc::new(HostMatchDialer::new(Arc::clone(&server_muxer), Arc::clone(&hub)));
    let acceptor = Arc::new(AgentAcceptor::new(Arc::clone(&hub), Arc::clone(&agent_store), conf.agent_secret.clone()));

    let api_state = http_api::ApiState {
        broker_id: Arc::from(conf.agent_domain.as_str()),
        hostname: Arc::from(gethostname().as_str()),
        started_at: Instant::now(),
    };
    let proxy_state = reverse_proxy::ProxyState::new(Arc::clone(&dialer), Arc::from(conf.agent_domain.as_str()));
    let router = http_api::router(api_state).merge(reverse_proxy::router(proxy_state));

    let reconnect_task = tokio::spawn({
        let upstream = upstream_client::UpstreamClient::new(conf_handle.clone(), shutdown.clone());
        let server_muxer = Arc::clone(&server_muxer);
        async move { upstream.run_reconnect_loop(server_muxer).await }
    });

    let reporting_task = tokio::spawn(reporting::run(
        Arc::clone(&server_muxer),
        broker_store,
        conf.report_interval,
        shutdown.clone(),
    ));

    let cert_refresh_task = tokio::spawn(cert_refresh::run(
        Arc::clone(&cert_source),
        cert_store,
        CERT_REFRESH_INTERVAL,
        shutdown.clone(),
    ));

    let server_http_task = tokio::spawn(mux_http::serve_reconnecting(
        Arc::clone(&server_muxer),
        router.clone(),
        shutdown.clone(),
    ));

    let tls_task = tokio::spawn(listener::run_tls(
        conf.public_tls_addr,
        Arc::clone(&cert_source),
        Arc::clone(&acceptor),
        router.clone(),
        shutdown.clone(),
    ));

    let quic_task = tokio::spawn(listener::run_quic(
        conf.public_quic_addr,
        Arc::clone(&cert_source),
        Arc::clone(&acceptor),
        router.clone(),
        shutdown.clone(),
    ));

    let local_listener = tokio::net::TcpListener::bind(conf.local_http_addr).await?;
    info!(addr = %conf.local_http_addr, "local HTTP API listening");
    let local_task = tokio::spawn(
        axum::serve(local_listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
            .with_graceful_shutdown(wait(shutdown.clone())),
    );

    wait(shutdown.clone()).await;

    let _ = reconnect_task.await;
    let _ = reporting_task.await;
    let _ = cert_refresh_task.await;
    let _ = server_http_task.await;
    match tls_task.await {
        Ok(Err(error)) => warn!(%error, "TLS listener exited with an error"),
        Err(error) => warn!(%error, "TLS listener task panicked"),
        Ok(Ok(())) => {}
    }
    match quic_task.await {
        Ok(Err(error)) => warn!(%error, "QUIC listener exited with an error"),
        Err(error) => warn!(%error, "QUIC listener task panicked"),
        Ok(Ok(())) => {}
    }
    match local_task.await {
        Ok(Err(error)) => warn!(%error, "local HTTP API exited with an error"),
        Err(error) => warn!(%error, "local HTTP API task panicked"),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn wait(mut shutdown: aegis_task::ShutdownSignal) {
    shutdown.wait().await;
}

fn gethostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| "aegis-broker".to_owned())
}
