//! # Peer Session Client Library
//!
//! This library gets two players from "I want to play" to a live, line-based
//! link between their games. It hides matchmaking, link setup and message
//! transport behind one polled interface, so a game loop only ever makes
//! non-blocking calls.
//!
//! ## Architecture Overview
//!
//! ### Network Adapters
//! A [`NetworkAdapter`] is a state machine advanced once per frame by
//! `update_state`. Two backends implement it:
//! - [`RendezvousAdapter`] matches players through the rendezvous server
//! - [`LocalAdapter`] finds hosts on the local network by datagram discovery
//!
//! Both walk the same states: `Idle`, `Updating` while hosts are listed,
//! `Connecting`, `Waiting`, `Finalizing` while the peer link is set up, and
//! finally `Game`. Any failure parks the adapter in `Failure` with a readable
//! reason until `reset()`.
//!
//! ### Background Work
//! Each adapter owns a small tokio runtime. Every network step runs there as
//! a task that the adapter polls; cancelling a step drops the task and every
//! socket it holds.
//!
//! ### Transport
//! Once both sides exchanged the handshake token, two workers move lines
//! between the socket and a pair of bounded queues. A full inbound queue
//! stalls the socket; a full outbound queue makes `send` return false.
//!
//! ### Reconciliation
//! [`GameSession`] drains received lines each tick, averages position updates
//! and applies shots, hits, power-ups and deaths to the remote avatar.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{GameSession, NetworkAdapter, RendezvousAdapter, RendezvousConfig};
//! use std::time::Duration;
//!
//! fn main() -> std::io::Result<()> {
//!     let mut adapter = RendezvousAdapter::new(RendezvousConfig::new("127.0.0.1", 2525))?;
//!     adapter.register("alice", 30, "LEVEL_1 arena.map");
//!
//!     let mut session = GameSession::new(adapter);
//!     loop {
//!         session.tick(1.0 / 60.0);
//!         std::thread::sleep(Duration::from_millis(16));
//!     }
//! }
//! ```
//!
//! Adapters must be created and dropped outside of any async context, since
//! they own their runtime.

pub mod adapter;
pub mod config;
pub mod discovery;
pub mod error;
pub mod game;
pub mod handshake;
pub mod local;
pub mod queue;
pub mod rendezvous;
pub mod task;
pub mod transport;
pub mod wire;

pub use adapter::{AdapterState, NetworkAdapter};
pub use config::{LocalConfig, RendezvousConfig, ServerAddr};
pub use error::NetError;
pub use game::{GameSession, RemotePlayer, TickOutcome};
pub use local::LocalAdapter;
pub use rendezvous::RendezvousAdapter;
