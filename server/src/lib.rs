//! # Rendezvous Server Library
//!
//! This library implements the matchmaking side of the peer-to-peer session
//! protocol. Hosts register a session and poll for a guest; guests list the
//! registered sessions and connect to one by cookie. Once both sides have
//! seen the match and announced `READY`, the server joins their sockets and
//! relays the in-game line protocol between them until either side leaves.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! Session bookkeeping independent of sockets:
//! - Cookie allocation and capacity limits
//! - Waiting / guest-attached / matched phases
//! - Parking of the first `READY` link until its partner arrives
//! - Liveness tracking and timeout sweeps
//!
//! ### Network Module (`network`)
//! TCP front end:
//! - One task per connection, reading newline-terminated commands
//! - Periodic sweeper for sessions whose host stopped polling
//! - Byte relay between paired links
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new("0.0.0.0:2525", 64).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod registry;
