mod config;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use pinrdma_config::{Config, ConfigManager};
use pinrdma_mem::sim::{FrameLayout, SimMemory};
use pinrdma_mem::{MemoryContext, SgBuilder};
use pinrdma_net_rdma::sim::SimFabric;
use pinrdma_net_rdma::{
    ControlConnector, ControlSurface, DeviceRegistry, RdmaError, SessionEngine, SessionRequest,
    TcpControlConnector,
};
use pinrdma_types::{ProcessId, Status};
use tokio::signal::unix::{signal, SignalKind};

use crate::config::LoopbackConfig;

const BUFFER_ADDR: u64 = 0x7f00_0000_0000;
const BUFFER_LEN: u64 = 4096;
const SERVER_TEXT: &[u8] = b"I'm server!\0";
const CLIENT_TEXT: &[u8] = b"Hello, I'm client!\0";

/// Server and client RDMA sessions in one process.
///
/// Both parties pin a 4 KiB buffer, exchange connection parameters over a
/// TCP control channel and move the client's buffer into the server's over
/// the simulated fabric. Each buffer is printed afterwards.
#[derive(Parser, Debug)]
#[command(name = "pinrdma-loopback", version, about)]
struct Args {
    /// RDMA device name
    #[arg(short = 'd', long, default_value = "sim0")]
    device: String,

    /// TCP port of the control channel
    #[arg(short = 'p', long = "port", default_value_t = 18515)]
    tcp_port: u16,

    /// RDMA port number
    #[arg(short = 'i', long, default_value_t = 1)]
    ib_port: u8,

    /// GID index
    #[arg(short = 'x', long, default_value_t = 0)]
    sgid_index: u8,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_default_config: bool,

    /// Host the client connects to
    servername: Option<String>,
}

struct Party {
    name: &'static str,
    surface: ControlSurface,
    ctx: Arc<MemoryContext>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.dump_default_config {
        println!("{}", toml::to_string_pretty(&LoopbackConfig::default())?);
        return Ok(());
    }

    let manager = match &args.config {
        Some(path) => ConfigManager::<LoopbackConfig>::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConfigManager::new(LoopbackConfig::default()),
    };
    let cfg = manager.get();
    cfg.validate()?;
    let _log_guard = pinrdma_logging::init_logging(&cfg.log)?;

    let server_ip = match &args.servername {
        Some(host) => resolve_v4(host, args.tcp_port).await?,
        None => Ipv4Addr::LOCALHOST,
    };
    tracing::info!(
        device = %args.device,
        port = args.tcp_port,
        ib_port = args.ib_port,
        sgid_index = args.sgid_index,
        server = %server_ip,
        "starting loopback"
    );

    let mem = Arc::new(SimMemory::new());
    let fabric = SimFabric::new(mem.clone());

    let mut client_session = cfg.session.clone();
    // The server may not be listening yet when the client dials.
    client_session.connect_retries = client_session.connect_retries.max(50);

    let server = party(
        "server",
        &mem,
        &fabric,
        &args.device,
        ProcessId(std::process::id()),
        SERVER_TEXT,
        Arc::new(TcpControlConnector::new(&cfg.session)),
        &cfg,
    )?;
    let client = party(
        "client",
        &mem,
        &fabric,
        &args.device,
        ProcessId(std::process::id() + 1),
        CLIENT_TEXT,
        Arc::new(TcpControlConnector::new(&client_session)),
        &cfg,
    )?;

    let srec = request(&args, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, args.tcp_port)).encode()?;
    let crec = request(&args, SocketAddrV4::new(server_ip, args.tcp_port)).encode()?;

    let sessions = async {
        tokio::join!(
            server.surface.write_ret(&server.ctx, &srec),
            client.surface.write_ret(&client.ctx, &crec),
        )
    };
    tokio::pin!(sessions);
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let (sret, cret) = loop {
        tokio::select! {
            rets = &mut sessions => break rets,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received CTRL+C");
                server.surface.shutdown();
                client.surface.shutdown();
                break (interrupted(), interrupted());
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                server.surface.shutdown();
                client.surface.shutdown();
                break (interrupted(), interrupted());
            }
            _ = sighup.recv() => {
                tracing::info!("Received SIGHUP");
                reload_config(&manager);
            }
        }
    };

    for (p, ret) in [(&server, sret), (&client, cret)] {
        let bytes = mem.read_user(p.ctx.pid(), BUFFER_ADDR, BUFFER_LEN as usize)?;
        println!("{} buffer: {}", p.name, printable(&bytes));
        tracing::info!(party = p.name, ret, "session finished");
    }

    let released = server.surface.release(server.ctx.pid()) + client.surface.release(client.ctx.pid());
    tracing::info!(released, "released tables");

    if sret < 0 || cret < 0 {
        bail!("session failed: server={sret} client={cret}");
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn party(
    name: &'static str,
    mem: &Arc<SimMemory>,
    fabric: &SimFabric,
    device: &str,
    pid: ProcessId,
    text: &[u8],
    connector: Arc<dyn ControlConnector>,
    cfg: &LoopbackConfig,
) -> anyhow::Result<Party> {
    let devices = Arc::new(DeviceRegistry::new());
    devices.register(fabric.add_device(device))?;
    let sg = Arc::new(SgBuilder::new(mem.clone()));
    let engine = SessionEngine::new(devices, sg, connector)
        .with_rdma_config(cfg.rdma.clone())
        .with_session_config(cfg.session.clone());

    mem.map_user(pid, BUFFER_ADDR, BUFFER_LEN, FrameLayout::Contiguous);
    mem.write_user(pid, BUFFER_ADDR, text)?;

    Ok(Party {
        name,
        surface: ControlSurface::new(Arc::new(engine)),
        ctx: Arc::new(MemoryContext::from_config(pid, &cfg.pin)),
    })
}

fn request(args: &Args, peer: SocketAddrV4) -> SessionRequest {
    SessionRequest {
        device_name: args.device.clone(),
        peer,
        rdma_port: args.ib_port,
        sgid_index: args.sgid_index,
        virt_addr: BUFFER_ADDR,
        length: BUFFER_LEN,
    }
}

async fn resolve_v4(host: &str, port: u16) -> anyhow::Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("resolving {host}"))?;
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            return Ok(*v4.ip());
        }
    }
    bail!("{host} has no IPv4 address")
}

/// Re-read the config file on SIGHUP. Sessions already running keep the
/// snapshot they started with.
fn reload_config(manager: &ConfigManager<LoopbackConfig>) {
    match manager.reload() {
        Ok(()) => {
            let cfg = manager.get();
            tracing::info!(
                handshake_timeout_ms = cfg.session.handshake_timeout_ms,
                completion_timeout_ms = ?cfg.session.completion_timeout_ms,
                level = %cfg.log.level,
                "config reloaded"
            );
        }
        Err(e) => tracing::warn!(error = %e, "config reload failed, keeping current"),
    }
}

/// Text up to the first NUL.
fn printable(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn interrupted() -> isize {
    -(Status::from(RdmaError::Cancelled).errno() as isize)
}
