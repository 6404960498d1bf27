//! # World Sync Server Library
//!
//! This library provides the authoritative side of the world synchronization
//! layer. It accepts clients over a reliable ordered channel (TCP) and a
//! real-time best-effort channel (UDP), walks each one through handshake,
//! authentication and real-time verification, and funnels everything they
//! send into a single authority that owns the game state.
//!
//! ## Core Responsibilities
//!
//! ### Single Authority
//! One task owns the [`game::GameState`]. Every change arrives as a
//! [`command::GameCommand`] on a bounded queue and is applied in queue order,
//! all or nothing. No other component reads or writes the state, so no lock
//! guards it.
//!
//! ### Connection Lifecycle
//! Each client moves through the phases of
//! [`connection_manager::ConnectionPhase`]. Only synchronized connections may
//! send gameplay messages; everything earlier accepts handshake, credential
//! and verification messages only. Every waiting phase times out.
//!
//! ### State Broadcasting
//! Creations and destructions go out on the reliable channel as they happen.
//! Position changes are coalesced and flushed over the real-time channel once
//! per authority tick.
//!
//! ## Data Flow
//!
//! ```text
//! socket bytes -> shared::codec -> processor -> authority queue
//!     -> command -> game state -> outbound dispatcher -> sockets
//! ```
//!
//! ## Ordering and Backpressure
//!
//! Reliable-channel commands keep the order they were sent in and wait for
//! room in the queue. Real-time commands carry a per-connection sequence
//! number; anything not newer than the last applied one is discarded, and a
//! full queue drops them outright.
//!
//! ## Module Organization
//!
//! - [`auth`]: credential checks
//! - [`authority`]: the queue, the authority loop and outbound routing
//! - [`command`]: commands, validation and movement rules
//! - [`config`]: deployment parameters
//! - [`connection_manager`]: per-connection state machine
//! - [`game`]: arena-backed game state and snapshots
//! - [`network`]: sockets and the tasks around them
//! - [`processor`]: message to command mapping
//! - [`registry`]: type tag to object factory mapping
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::game::GameState;
//! use server::network::Server;
//! use server::registry::ObjectFactoryRegistry;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let state = GameState::new(Arc::new(ObjectFactoryRegistry::standard()));
//!     let server = Server::bind(ServerConfig::default(), state).await?;
//!
//!     // Serve until Ctrl+C, then hand back the final world.
//!     let state = server
//!         .run(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await?;
//!     println!("{} objects at shutdown", state.len());
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod authority;
pub mod command;
pub mod config;
pub mod connection_manager;
pub mod game;
pub mod network;
pub mod processor;
pub mod registry;
