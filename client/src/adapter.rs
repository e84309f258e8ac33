//! The contract between the game loop and a matchmaking backend.
//!
//! Every method is non-blocking and meant to be called from the game loop
//! thread. Background work advances only through `update_state`, which the
//! loop calls once per tick.

use shared::Host;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterState {
    Idle,
    /// Collecting the list of joinable hosts
    Updating,
    /// Registering as host, or attaching to a host as guest
    Connecting,
    /// Host: waiting for a guest. Guest: waiting for the host to notice.
    Waiting,
    /// Setting up the direct link and running the handshake
    Finalizing,
    Game,
    Failure,
}

impl fmt::Display for AdapterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterState::Idle => "IDLE",
            AdapterState::Updating => "UPDATING",
            AdapterState::Connecting => "CONNECTING",
            AdapterState::Waiting => "WAITING",
            AdapterState::Finalizing => "FINALIZING",
            AdapterState::Game => "GAME",
            AdapterState::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

pub trait NetworkAdapter {
    /// Advances background work by one tick of `dt` seconds.
    fn update_state(&mut self, dt: f32);

    /// Starts collecting joinable hosts. Only honored from `Idle`.
    fn update_hosts(&mut self);

    fn stop_host_update(&mut self);

    /// Replaces the contents of `out` with the currently known hosts.
    fn get_hosts(&mut self, out: &mut Vec<Host>);

    /// Offers a session. Always resets first, whatever the current state.
    fn register(&mut self, nickname: &str, timeout_secs: u32, data: &str);

    /// Joins `host`. Always resets first, whatever the current state.
    fn connect(&mut self, host: &Host);

    /// Cancels everything and returns to `Idle`. Idempotent.
    fn reset(&mut self);

    /// Queues a line for the peer. False outside `Game` or when the
    /// outbound queue is full.
    fn send(&mut self, line: &str) -> bool;

    /// Next received line, if any. Never blocks.
    fn receive(&mut self) -> Option<String>;

    fn state(&self) -> AdapterState;

    /// Game data of the current session: our own as host, the host's as
    /// guest.
    fn data(&self) -> Option<&str>;

    /// Why the adapter entered `Failure`.
    fn failure_reason(&self) -> Option<&str>;
}

impl<A: NetworkAdapter + ?Sized> NetworkAdapter for Box<A> {
    fn update_state(&mut self, dt: f32) {
        (**self).update_state(dt)
    }

    fn update_hosts(&mut self) {
        (**self).update_hosts()
    }

    fn stop_host_update(&mut self) {
        (**self).stop_host_update()
    }

    fn get_hosts(&mut self, out: &mut Vec<Host>) {
        (**self).get_hosts(out)
    }

    fn register(&mut self, nickname: &str, timeout_secs: u32, data: &str) {
        (**self).register(nickname, timeout_secs, data)
    }

    fn connect(&mut self, host: &Host) {
        (**self).connect(host)
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn send(&mut self, line: &str) -> bool {
        (**self).send(line)
    }

    fn receive(&mut self) -> Option<String> {
        (**self).receive()
    }

    fn state(&self) -> AdapterState {
        (**self).state()
    }

    fn data(&self) -> Option<&str> {
        (**self).data()
    }

    fn failure_reason(&self) -> Option<&str> {
        (**self).failure_reason()
    }
}
