use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use raftlock::raft::tcp::TcpClient;
use raftlock::util::Shutdown;

#[derive(Debug, Parser)]
#[command(name = "raftlock", version, about = "A distributed lock replicated with raft.")]
struct Args {
    /// Location of the config file.
    #[arg(long, value_name = "PATH", default_value = "Config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Run a node. This is the default.
    Run,
    /// Print the status of a node.
    Status {
        #[arg(long)]
        addr: SocketAddr,
    },
    /// Replicate a command through the leader.
    Propose {
        #[arg(long)]
        addr: SocketAddr,
        command: String,
    },
    /// Take a lock through the leader.
    Acquire {
        #[arg(long)]
        addr: SocketAddr,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        lock: String,
        holder: String,
    },
    /// Release a lock through the leader.
    Release {
        #[arg(long)]
        addr: SocketAddr,
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        lock: String,
        holder: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    match args.command.unwrap_or(Cmd::Run) {
        Cmd::Run => run(args.config).await,
        Cmd::Status { addr } => {
            let status = TcpClient::connect(addr).await?.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Cmd::Propose { addr, command } => {
            let index = TcpClient::connect(addr)
                .await?
                .propose(command.into_bytes())
                .await?;
            println!("committed at index {}", index);
            Ok(())
        }
        Cmd::Acquire {
            addr,
            timeout_ms,
            lock,
            holder,
        } => {
            let mut client = TcpClient::connect(addr).await?;
            let acquired = client
                .acquire(&lock, &holder, Duration::from_millis(timeout_ms))
                .await?;
            println!("{}", if acquired { "acquired" } else { "held elsewhere" });
            Ok(())
        }
        Cmd::Release {
            addr,
            timeout_ms,
            lock,
            holder,
        } => {
            let mut client = TcpClient::connect(addr).await?;
            let released = client
                .release(&lock, &holder, Duration::from_millis(timeout_ms))
                .await?;
            if released {
                println!("released");
            } else {
                println!("not held by {}", holder);
            }
            Ok(())
        }
    }
}

async fn run(config: PathBuf) -> anyhow::Result<()> {
    let config = raftlock::config::load(&config)?;
    let _guard = raftlock::logger::init(&config.logging)?;

    let shutdown = Shutdown::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || signal.shutdown())?;

    raftlock::run(config, shutdown).await?;
    Ok(())
}
