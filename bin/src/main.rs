//! `dnsfwd`: loads its configuration, binds its listening sockets, and
//! runs the UDP and TCP serving loops side by side until asked to stop.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dnsfwd_server::config::Options;
use dnsfwd_server::net;
use dnsfwd_server::observer::{NoCache, NoopObserver};
use dnsfwd_server::tcp::TcpServer;
use dnsfwd_server::udp::UdpServer;
use dnsfwd_server::upstream::{UpstreamServer, UpstreamSet};
use dnsfwd_server::ForwardingEngine;
use tokio::net::{TcpListener, UdpSocket};
use tracing_subscriber::EnvFilter;

/// Accept DNS queries over UDP and TCP, route them to upstream
/// nameservers by per-domain rule, and relay replies back.
#[derive(Parser, Debug)]
#[command(name = "dnsfwd", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "dnsfwd.toml")]
    config: PathBuf,

    /// Increase log verbosity; repeat for more (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "dnsfwd=info",
        1 => "dnsfwd=debug",
        _ => "dnsfwd=trace,dnsfwd_server=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let options = Options::load(&cli.config).with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    tracing::info!(
        listen = ?options.listen,
        servers = options.servers.len(),
        "starting dnsfwd",
    );

    let servers = build_upstreams(&options).await.context("binding upstream sockets")?;
    let engine = Arc::new(ForwardingEngine::new(options.clone(), servers, Box::new(NoCache), Box::new(NoopObserver)));

    let udp_listeners = bind_udp_listeners(&options.listen).context("binding UDP listeners")?;
    let tcp_listeners = bind_tcp_listeners(&options.listen).await.context("binding TCP listeners")?;

    let udp_server = UdpServer::new(engine.clone());
    let udp_task = tokio::spawn(async move { udp_server.run(udp_listeners).await });

    let mut tcp_tasks = tokio::task::JoinSet::new();
    for listener in tcp_listeners {
        let tcp_server = TcpServer::new(engine.clone());
        tcp_tasks.spawn(async move { tcp_server.run(listener).await });
    }

    tokio::select! {
        result = udp_task => {
            result.context("udp server task panicked")?.context("udp server failed")?;
        }
        Some(result) = tcp_tasks.join_next() => {
            result.context("tcp server task panicked")?.context("tcp server failed")?;
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutting down");
        }
    }

    Ok(())
}

/// Races `ctrl_c()` against `SIGTERM`, returning as soon as either fires.
/// On Unix, `SIGHUP` is also watched but only logs a reload notice and
/// keeps waiting — this binary has no reloadable state yet, so a HUP is
/// acknowledged rather than acted on.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received ctrl-c");
                return;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM");
                return;
            }
            _ = sighup.recv() => {
                tracing::info!("received SIGHUP, reload not implemented, continuing");
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
}

fn bind_udp_listeners(addrs: &[SocketAddr]) -> Result<Vec<UdpSocket>> {
    addrs
        .iter()
        .map(|&addr| net::bind_pktinfo_socket(addr).with_context(|| format!("binding UDP listener {addr}")))
        .collect()
}

async fn bind_tcp_listeners(addrs: &[SocketAddr]) -> Result<Vec<TcpListener>> {
    let mut listeners = Vec::with_capacity(addrs.len());
    for &addr in addrs {
        let listener = TcpListener::bind(addr).await.with_context(|| format!("binding TCP listener {addr}"))?;
        listeners.push(listener);
    }
    Ok(listeners)
}

/// Builds the upstream set from configuration, sharing one outbound UDP
/// socket per address family across every upstream of that family —
/// mirroring how the original keeps one `serverfd` per family rather
/// than one socket per configured server.
async fn build_upstreams(options: &Options) -> Result<UpstreamSet> {
    let v4_socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await.context("binding outbound IPv4 socket")?);
    let v6_socket = UdpSocket::bind("[::]:0").await.ok().map(Arc::new);

    let mut servers = Vec::with_capacity(options.servers.len());
    for spec in &options.servers {
        let udp = if spec.address.is_ipv4() {
            v4_socket.clone()
        } else {
            v6_socket.clone().with_context(|| format!("server {} needs IPv6 but no IPv6 socket is available", spec.address))?
        };
        servers.push(UpstreamServer {
            addr: spec.address,
            flags: spec.flags(),
            domain: spec.domain.clone(),
            literal: spec.literal_address,
            udp,
        });
    }
    Ok(UpstreamSet::new(servers))
}
