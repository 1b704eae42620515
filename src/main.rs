use core::time::Duration;

use std::path::PathBuf;

use anyhow::{bail, Context as _};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::{select, signal};
use tracing::{debug, error, info, warn};
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use wasinet::addr::SocketType;
use wasinet::{Config, Connection, Network, NetworkKind, PacketEndpoint};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[clap(long = "config", env = "WASINET_CONFIG")]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Resolve an address to the candidates a dial would try
    Resolve {
        network: String,
        address: String,

        /// Resolve for listening rather than dialing
        #[clap(long)]
        listen: bool,
    },
    /// Echo everything received on an address back to its sender
    Echo { network: String, address: String },
    /// Send a message and print the reply
    Send {
        network: String,
        address: String,
        message: String,

        /// Seconds to wait for a datagram reply
        #[clap(long, default_value_t = 5)]
        timeout: u64,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::from_env());
    };
    let config = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    let config = Config::from_toml(&config)
        .with_context(|| format!("failed to parse `{}`", path.display()))?;
    Ok(config.with_env())
}

async fn echo_stream(conn: Connection) -> anyhow::Result<()> {
    let remote = conn.remote_addr().to_string();
    let mut buf = vec![0; 8192];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            debug!(%remote, "peer closed the connection");
            break;
        }
        conn.write_all(&buf[..n]).await?;
    }
    conn.close()?;
    Ok(())
}

async fn serve_stream(network: &Network, net: &str, address: &str) -> anyhow::Result<()> {
    let listener = network.listen(net, address)?;
    info!(local = %listener.local_addr(), "listening");
    let mut tasks = JoinSet::new();
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        select! {
            res = listener.accept() => {
                let conn = res?;
                info!(remote = %conn.remote_addr(), "accepted connection");
                tasks.spawn(echo_stream(conn));
            }
            Some(res) = tasks.join_next() => {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(?err, "connection failed"),
                    Err(err) => error!(?err, "connection task panicked"),
                }
            }
            res = &mut ctrl_c => {
                res.context("failed to listen for ^C")?;
                info!("^C received, shutting down");
                listener.close()?;
                return Ok(())
            }
        }
    }
}

async fn serve_packet(network: &Network, net: &str, address: &str) -> anyhow::Result<()> {
    let endpoint = network.listen_packet(net, address)?;
    info!(local = %endpoint.local_addr(), "listening");
    let ctrl_c = signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut buf = vec![0; 65536];
    loop {
        let received = select! {
            res = endpoint.read_from(&mut buf) => res?,
            res = &mut ctrl_c => {
                res.context("failed to listen for ^C")?;
                info!("^C received, shutting down");
                endpoint.close()?;
                return Ok(())
            }
        };
        let Some((n, src)) = received else {
            info!("endpoint closed");
            return Ok(());
        };
        debug!(%src, n, "received datagram");
        endpoint.write_to(&buf[..n], &src).await?;
    }
}

async fn send_stream(
    network: &Network,
    net: &str,
    address: &str,
    message: &str,
) -> anyhow::Result<()> {
    let conn = network.dial(net, address).await?;
    info!(local = %conn.local_addr(), remote = %conn.remote_addr(), "connected");
    conn.write_all(message.as_bytes()).await?;
    if let Err(err) = conn.close_write() {
        warn!(%err, "failed to half-close connection, reading a single reply");
        let mut buf = vec![0; 8192];
        let n = conn.read(&mut buf).await?;
        println!("{}", String::from_utf8_lossy(&buf[..n]));
        return Ok(());
    }
    let mut reply = vec![];
    let mut buf = vec![0; 8192];
    loop {
        let n = conn.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

async fn send_packet(
    network: &Network,
    net: &str,
    address: &str,
    message: &str,
    timeout: Duration,
) -> anyhow::Result<()> {
    let endpoint: PacketEndpoint = network.dial_packet(net, None, address).await?;
    endpoint.write(message.as_bytes()).await?;
    let mut buf = vec![0; 65536];
    let n = tokio::time::timeout(timeout, endpoint.read(&mut buf))
        .await
        .context("timed out waiting for a reply")??;
    println!("{}", String::from_utf8_lossy(&buf[..n]));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Args { config, cmd } = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().compact().without_time())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = load_config(config)?;
    let network = Network::new(wasinet::host::platform(), config);
    match cmd {
        Command::Resolve {
            network: net,
            address,
            listen,
        } => {
            let purpose = if listen {
                wasinet::Purpose::Listen
            } else {
                wasinet::Purpose::Dial
            };
            let addrs = network.resolve(purpose, &net, &address)?;
            for addr in addrs {
                println!("{addr}");
            }
            Ok(())
        }
        Command::Echo {
            network: net,
            address,
        } => {
            let kind: NetworkKind = net
                .parse()
                .with_context(|| format!("invalid network `{net}`"))?;
            match kind.socket_type() {
                SocketType::Stream => serve_stream(&network, &net, &address).await,
                SocketType::Datagram => serve_packet(&network, &net, &address).await,
                SocketType::Any => bail!("network `{net}` has no socket type"),
            }
        }
        Command::Send {
            network: net,
            address,
            message,
            timeout,
        } => {
            let kind: NetworkKind = net
                .parse()
                .with_context(|| format!("invalid network `{net}`"))?;
            match kind.socket_type() {
                SocketType::Stream => send_stream(&network, &net, &address, &message).await,
                SocketType::Datagram => {
                    send_packet(
                        &network,
                        &net,
                        &address,
                        &message,
                        Duration::from_secs(timeout),
                    )
                    .await
                }
                SocketType::Any => bail!("network `{net}` has no socket type"),
            }
        }
    }
}
