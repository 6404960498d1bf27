use clap::Parser;
use client::{Client, ClientConfig};
use log::{info, warn};
use rand::Rng;
use shared::{Direction, NetworkMessage, Position, TypeTag};
use std::time::Duration;
use tokio::time::interval;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server reliable (TCP) address
    #[arg(short = 'r', long, default_value = "127.0.0.1:8080")]
    reliable: String,

    /// Server real-time (UDP) address
    #[arg(short = 'u', long, default_value = "127.0.0.1:8081")]
    realtime: String,

    /// Credentials sent during authentication
    #[arg(short = 'c', long, default_value = "")]
    credential: String,

    /// Random inputs sent per second
    #[arg(short = 'i', long, default_value = "10")]
    input_rate: u32,

    /// Stop after this many inputs (0 runs until Ctrl+C)
    #[arg(short = 'n', long, default_value = "0")]
    count: u32,

    /// Chance per input of also asking for a marker at the player's position
    #[arg(long, default_value = "0.05")]
    spawn_chance: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting client...");
    let mut client = Client::connect(ClientConfig {
        reliable_addr: args.reliable.clone(),
        realtime_addr: args.realtime.clone(),
        credentials: args.credential.clone().into_bytes(),
        ..ClientConfig::default()
    })
    .await?;

    let mut inputs = interval(Duration::from_secs_f64(1.0 / args.input_rate.max(1) as f64));
    let mut sent = 0u32;

    loop {
        tokio::select! {
            _ = inputs.tick() => {
                if args.count > 0 && sent >= args.count {
                    break;
                }

                let (direction, spawn) = {
                    let mut rng = rand::thread_rng();
                    let direction = Direction::ALL[rng.gen_range(0..Direction::ALL.len())];
                    (direction, rng.gen_bool(args.spawn_chance.clamp(0.0, 1.0)))
                };
                client.send_input(direction).await?;
                sent += 1;

                if spawn {
                    let at = client
                        .world()
                        .player()
                        .map(|p| p.position)
                        .unwrap_or(Position::new(0, 0));
                    client.request_spawn(TypeTag::Marker, at).await?;
                }
            }
            message = client.poll() => match message? {
                NetworkMessage::Disconnect { reason } => {
                    warn!("Server disconnected us: {:?}", reason);
                    return Ok(());
                }
                NetworkMessage::ObjectCreateAck { request, object } => {
                    info!("Spawn request {} created object {}", request, object);
                }
                NetworkMessage::ObjectUpdate { object, position, .. }
                    if Some(object) == client.player() =>
                {
                    info!("Player at ({}, {})", position.x, position.y);
                }
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                println!("Received Ctrl+C, shutting down gracefully...");
                break;
            }
        }
    }

    info!(
        "Sent {} inputs, {} objects in view",
        sent,
        client.world().len()
    );
    client.disconnect().await?;
    Ok(())
}
