//! # World Sync Client Library
//!
//! A headless client for the world synchronization server. It performs the
//! whole connection sequence, keeps a mirror of the authoritative world and
//! sends player input.
//!
//! ## Connection Sequence
//!
//! 1. Open the reliable (TCP) stream and send `Handshake` with the protocol
//!    version, followed by `AuthRequest` with the credentials.
//! 2. Wait for `AuthResponse::Accepted` and the `VerificationCode` that
//!    follows it.
//! 3. Echo the code from the real-time (UDP) socket, repeating until the
//!    server answers with `SyncComplete` on the reliable stream.
//!
//! After that the server streams `ObjectCreate` for the current world, then
//! keeps the mirror fresh with creates and destroys on the reliable stream
//! and coalesced `ObjectUpdate`s on the real-time socket.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`Client`] and its configuration: connecting, sending input and spawn
//! requests, and pumping both channels through [`Client::poll`].
//!
//! ### World Module (`world`)
//! [`WorldMirror`], the client's copy of the world as last reported.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Client, ClientConfig};
//! use shared::Direction;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::connect(ClientConfig {
//!         credentials: b"secret".to_vec(),
//!         ..ClientConfig::default()
//!     })
//!     .await?;
//!
//!     let player = client.player().expect("assigned on synchronization");
//!     client.send_input(Direction::Up).await?;
//!     client
//!         .poll_until(Duration::from_secs(1), |_, world| {
//!             world.get(player).is_some_and(|p| p.position.y == 1)
//!         })
//!         .await?;
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod world;

pub use network::{Client, ClientConfig, ClientError};
pub use world::{MirroredObject, WorldMirror};
