use clap::{Parser, ValueEnum};
use log::info;
use server::command::DisconnectPolicy;
use server::config::{PhaseTimeouts, ServerConfig};
use server::game::{GameState, Snapshot};
use server::network::Server;
use server::registry::ObjectFactoryRegistry;
use shared::Position;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnDisconnect {
    /// Destroy everything the connection owned
    Destroy,
    /// Keep the objects, without an owner
    Disown,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Reliable (TCP) bind address
    #[arg(short = 'r', long, default_value = "127.0.0.1:8080")]
    reliable: String,

    /// Real-time (UDP) bind address
    #[arg(short = 'u', long, default_value = "127.0.0.1:8081")]
    realtime: String,

    /// Authority ticks per second
    #[arg(short = 't', long, default_value = "30")]
    tick_rate: u32,

    /// Bound of the authority command queue
    #[arg(long, default_value = "1024")]
    queue_capacity: usize,

    /// Maximum number of admitted connections
    #[arg(short = 'm', long, default_value = "32")]
    max_connections: usize,

    /// Heartbeat and timeout sweep interval in milliseconds
    #[arg(long, default_value = "1000")]
    heartbeat_ms: u64,

    /// Time allowed for each handshake phase, and for heartbeat silence, in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Protocol violations tolerated before disconnecting
    #[arg(long, default_value = "8")]
    violation_limit: u32,

    /// Accepted credential (repeatable). None means any credentials are accepted.
    #[arg(short = 'c', long = "credential")]
    credentials: Vec<String>,

    /// What happens to a departing connection's objects
    #[arg(long, value_enum, default_value = "destroy")]
    on_disconnect: OnDisconnect,

    /// Restore the world from this snapshot file, and save it back on shutdown
    #[arg(long)]
    snapshot: Option<String>,
}

impl Args {
    fn config(&self) -> ServerConfig {
        let timeout = Duration::from_millis(self.timeout_ms);
        ServerConfig {
            reliable_addr: self.reliable.clone(),
            realtime_addr: self.realtime.clone(),
            tick_rate: self.tick_rate,
            queue_capacity: self.queue_capacity,
            max_connections: self.max_connections,
            heartbeat_interval: Duration::from_millis(self.heartbeat_ms),
            timeouts: PhaseTimeouts {
                handshake: timeout,
                authentication: timeout,
                verification: timeout,
                heartbeat: timeout,
            },
            violation_limit: self.violation_limit,
            credentials: self.credentials.clone(),
            disconnect_policy: match self.on_disconnect {
                OnDisconnect::Destroy => DisconnectPolicy::DestroyOwned,
                OnDisconnect::Disown => DisconnectPolicy::Disown,
            },
            spawn_position: Position::new(0, 0),
            ..ServerConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();
    let registry = Arc::new(ObjectFactoryRegistry::standard());

    let state = match &args.snapshot {
        Some(path) if std::path::Path::new(path).exists() => {
            let snapshot = Snapshot::from_bytes(&std::fs::read(path)?)?;
            info!("Restored {} objects from {}", snapshot.objects.len(), path);
            GameState::restore(registry, snapshot)?
        }
        _ => GameState::new(registry),
    };

    info!("Starting server...");
    let server = Server::bind(args.config(), state).await?;

    let state = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("Failed to listen for Ctrl+C: {}", e);
            }
            println!("Received Ctrl+C, shutting down gracefully...");
        })
        .await?;

    if let Some(path) = &args.snapshot {
        std::fs::write(path, state.snapshot().to_bytes()?)?;
        info!("Saved {} objects to {}", state.len(), path);
    }

    Ok(())
}
