//! Entry point for `nfs-rpc`.
//!
//! `ping` mounts a server and times null calls against it; `serve` answers
//! null calls for a program so there is something to ping. All protocol work
//! lives in the library; `main.rs` owns only process setup.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use nfs_rpc::congestion::ticks;
use nfs_rpc::procs::{NFS_PROG, NFS_VER2};
use nfs_rpc::server::NullService;
use nfs_rpc::{CallPolicy, CallRequest, MountConfig, RpcClient, RpcServer};

/// Sun RPC call engine with NFS-style retransmission.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Time null calls against a server.
    Ping {
        /// Server address (e.g. 127.0.0.1:2049).
        server: SocketAddr,
        /// Mount options, e.g. "soft,proto=tcp,retrans=4".
        #[arg(short, long, default_value = "")]
        options: String,
        /// Number of calls.
        #[arg(short, long, default_value_t = 4)]
        count: u32,
        #[arg(long, default_value_t = NFS_PROG)]
        program: u32,
        #[arg(long, default_value_t = NFS_VER2)]
        version: u32,
    },
    /// Answer null calls until interrupted.
    Serve {
        /// Local address to bind (e.g. 0.0.0.0:2049).
        #[arg(short, long, default_value = "127.0.0.1:2049")]
        bind: SocketAddr,
        #[arg(long, default_value_t = NFS_PROG)]
        program: u32,
        #[arg(long, default_value_t = NFS_VER2)]
        version: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    match Cli::parse().mode {
        Mode::Ping {
            server,
            options,
            count,
            program,
            version,
        } => ping(server, &options, count, program, version).await,
        Mode::Serve {
            bind,
            program,
            version,
        } => serve(bind, program, version).await,
    }
}

async fn ping(
    server: SocketAddr,
    options: &str,
    count: u32,
    program: u32,
    version: u32,
) -> Result<()> {
    let config = MountConfig::parse(server, options)?;
    let client = RpcClient::new();
    let mount = client
        .mount(config)
        .await
        .with_context(|| format!("mounting {server}"))?;
    log::info!("Pinging {server} over {}", mount.config().sotype);

    for seq in 0..count {
        let started = Instant::now();
        let req = CallRequest::new(program, version, 0, Vec::new());
        match mount.call(req, CallPolicy::default()).await {
            Ok(_) => println!("null call {seq}: {:?}", started.elapsed()),
            Err(e) => println!("null call {seq}: {e}"),
        }
    }

    let cong = mount.congestion();
    let stats = client.stats();
    println!(
        "rto {:?}, srtt {:?}, window {}, ssthresh {}",
        ticks(cong.rto),
        ticks(cong.srtt >> 3),
        cong.window,
        cong.ssthresh
    );
    println!(
        "{} requests, {} retries, {} timeouts, {} unexpected",
        stats.requests, stats.retries, stats.timeouts, stats.unexpected
    );
    Ok(())
}

async fn serve(bind: SocketAddr, program: u32, version: u32) -> Result<()> {
    let server = Arc::new(RpcServer::new().register(Arc::new(NullService { program, version })));
    let udp = UdpSocket::bind(bind)
        .await
        .with_context(|| format!("binding udp {bind}"))?;
    let tcp = TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding tcp {bind}"))?;
    log::info!("Serving program {program} v{version} on {bind} (udp+tcp)");

    let shutdown = CancellationToken::new();
    let udp_task = tokio::spawn(server.clone().serve_udp(udp, shutdown.clone()));
    let tcp_task = tokio::spawn(server.serve_tcp(tcp, shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    shutdown.cancel();
    udp_task.await??;
    tcp_task.await??;
    Ok(())
}
