// WaveDrop Linux host: relay service, LAN signaling, file transport and acoustic key tools.

mod broadcast;
mod config;
mod http;
mod listen;
mod logging;
mod qr;
mod transport;

use std::io::Read;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use wavedrop_core::acoustic::{self, encode_key};
use wavedrop_core::{
    signal, ConnectionDescription, MemoryRelayStore, SessionKey, SignalKind, SignalMessage,
};

#[derive(Parser)]
#[command(name = "wavedrop", version, about = "WaveDrop peer-to-peer file sharing host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve the relay HTTP API and log LAN signaling traffic
    Relay {
        /// Listen port (default from config)
        #[arg(long)]
        port: Option<u16>,
        /// Bind on all interfaces instead of localhost
        #[arg(long)]
        public: bool,
    },
    /// Generate a session key
    Key,
    /// Encode a connection description (JSON) into a compact token
    Encode {
        /// JSON file, or `-` for stdin
        #[arg(default_value = "-")]
        input: PathBuf,
        /// Also print the token as a QR code
        #[arg(long)]
        qr: bool,
    },
    /// Decode a compact token back into description JSON
    Decode { token: String },
    /// Render a session key as tones (raw f32le mono PCM)
    Tones {
        key: String,
        #[arg(long, short)]
        out: PathBuf,
        #[arg(long, default_value_t = 0.5)]
        amplitude: f32,
    },
    /// Listen for a session key in raw f32le mono PCM (`-` for stdin)
    Listen { input: PathBuf },
    /// Send a file to a waiting receiver
    Send { addr: SocketAddr, file: PathBuf },
    /// Wait for one file on the transfer port
    Receive {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
        #[arg(long)]
        port: Option<u16>,
    },
    /// LAN broadcast signaling
    Signal {
        #[command(subcommand)]
        action: SignalCmd,
    },
}

#[derive(Debug, Subcommand)]
enum SignalCmd {
    /// Broadcast a token under a key, repeating until the time runs out
    Publish {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        key: String,
        token: String,
        #[arg(long, default_value_t = 60)]
        for_secs: u64,
    },
    /// Wait for a token published under a key and print it
    Wait {
        #[arg(long, value_enum)]
        kind: Kind,
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Kind {
    Offer,
    Answer,
}

impl From<Kind> for SignalKind {
    fn from(k: Kind) -> Self {
        match k {
            Kind::Offer => SignalKind::Offer,
            Kind::Answer => SignalKind::Answer,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init();
    let cfg = config::load();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, cfg))
}

async fn run(command: Commands, cfg: config::Config) -> anyhow::Result<()> {
    match command {
        Commands::Relay { port, public } => {
            let port = port.unwrap_or(cfg.relay_port);
            let host = if public { "0.0.0.0" } else { "127.0.0.1" };
            let bind: SocketAddr = format!("{}:{}", host, port).parse()?;
            let store = Arc::new(tokio::sync::Mutex::new(MemoryRelayStore::new()));
            let relay = tokio::spawn(http::run_relay(bind, store, cfg.record_ttl()));
            match broadcast::Broadcast::join(cfg.broadcast_port).await {
                Ok(bus) => {
                    tokio::spawn(async move {
                        if let Err(e) = bus.watch().await {
                            warn!(error = %e, "broadcast watch stopped");
                        }
                    });
                }
                Err(e) => warn!(port = cfg.broadcast_port, error = %e, "LAN signaling unavailable"),
            }
            tokio::select! {
                res = relay => res.context("relay task panicked")?.context("relay server failed")?,
                res = shutdown_signal() => res?,
            }
            info!("relay stopped");
        }
        Commands::Key => println!("{}", SessionKey::generate()),
        Commands::Encode { input, qr } => {
            let json = read_input(&input)?;
            let description: ConnectionDescription =
                serde_json::from_str(&json).context("input is not a connection description")?;
            let token = signal::encode(&description)?;
            println!("{}", token);
            if qr {
                println!("{}", qr::render(token.as_str())?);
            }
        }
        Commands::Decode { token } => {
            let description = signal::decode(&token)?;
            println!("{}", serde_json::to_string_pretty(&description)?);
        }
        Commands::Tones { key, out, amplitude } => {
            let key = SessionKey::parse(&key)?;
            let receiver = cfg.receiver_config();
            receiver.tones.validate(cfg.sample_rate)?;
            let schedule = encode_key(key.as_str(), &receiver.tones)?;
            let pcm = acoustic::render(&schedule, cfg.sample_rate, amplitude.clamp(0.0, 1.0));
            tokio::fs::write(&out, listen::samples_to_bytes(&pcm))
                .await
                .with_context(|| format!("writing {}", out.display()))?;
            info!(
                key = %key,
                tones = schedule.len(),
                duration_ms = schedule.total_duration_ms(),
                sample_rate = cfg.sample_rate,
                path = %out.display(),
                "tones written"
            );
        }
        Commands::Listen { input } => {
            let key = listen::listen_file(&input, cfg.receiver_config()).await?;
            println!("{}", key);
        }
        Commands::Send { addr, file } => {
            transport::send_file(addr, &file, cfg.transfer_params()).await?;
        }
        Commands::Receive { out_dir, port } => {
            let path = transport::receive_file(port.unwrap_or(cfg.transfer_port), &out_dir).await?;
            println!("{}", path.display());
        }
        Commands::Signal { action } => run_signal(action, &cfg).await?,
    }
    Ok(())
}

async fn run_signal(action: SignalCmd, cfg: &config::Config) -> anyhow::Result<()> {
    let bus = broadcast::Broadcast::join(cfg.broadcast_port)
        .await
        .with_context(|| format!("joining broadcast group on port {}", cfg.broadcast_port))?;
    match action {
        SignalCmd::Publish {
            kind,
            key,
            token,
            for_secs,
        } => {
            // Fail early on a token the peer could not decode.
            signal::decode(&token)?;
            let msg = SignalMessage::new(kind.into(), key, token);
            tokio::select! {
                res = bus.publish_repeating(&msg) => res?,
                _ = tokio::time::sleep(Duration::from_secs(for_secs)) => {}
                res = shutdown_signal() => res?,
            }
        }
        SignalCmd::Wait {
            kind,
            key,
            timeout_secs,
        } => match bus
            .wait_for(kind.into(), &key, Duration::from_secs(timeout_secs))
            .await?
        {
            Some(msg) => println!("{}", msg.payload),
            None => bail!("no {:?} for key {} within {}s", kind, key, timeout_secs),
        },
    }
    Ok(())
}

fn read_input(path: &Path) -> anyhow::Result<String> {
    if path.as_os_str() == "-" {
        let mut s = String::new();
        std::io::stdin().read_to_string(&mut s)?;
        return Ok(s);
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
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
