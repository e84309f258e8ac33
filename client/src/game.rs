//! Applies what the peer sends to the local view of its avatar.
//!
//! Each tick drains a bounded number of received lines in arrival order.
//! Position updates within one tick are averaged and applied once; the
//! discrete events apply as they come. A death or a close stops the drain
//! right there and ends the session.

use crate::adapter::{AdapterState, NetworkAdapter};
use log::{debug, info, warn};
use shared::{GameMessage, CLOSE_LINE};

/// Upper bound on lines consumed per tick, so a flood cannot stall a frame
pub const MAX_LINES_PER_TICK: usize = 64;

/// Seconds a remote avatar ignores further hits after taking one
pub const HIT_INVULNERABILITY: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerUp {
    Shield,
    DoubleShot,
    Speed,
}

impl PowerUp {
    pub fn from_id(id: &str) -> Option<PowerUp> {
        match id {
            "SHIELD" => Some(PowerUp::Shield),
            "DOUBLE_SHOT" => Some(PowerUp::DoubleShot),
            "SPEED" => Some(PowerUp::Speed),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            PowerUp::Shield => "SHIELD",
            PowerUp::DoubleShot => "DOUBLE_SHOT",
            PowerUp::Speed => "SPEED",
        }
    }
}

/// Local view of the peer's avatar
#[derive(Debug, Clone, Default)]
pub struct RemotePlayer {
    pub x: f32,
    pub y: f32,
    pub angle: f32,
    pub shots_fired: u32,
    pub hits_taken: u32,
    pub invulnerable_for: f32,
    pub power_ups: Vec<PowerUp>,
    /// Set once the peer died; the avatar should no longer be drawn
    pub removed: bool,
}

impl RemotePlayer {
    pub fn fire(&mut self) {
        self.shots_fired += 1;
    }

    /// Returns false when the hit landed inside the invulnerability window.
    pub fn take_hit(&mut self) -> bool {
        if self.is_invulnerable() {
            return false;
        }
        self.hits_taken += 1;
        self.invulnerable_for = HIT_INVULNERABILITY;
        true
    }

    pub fn grant(&mut self, power_up: PowerUp) {
        if !self.power_ups.contains(&power_up) {
            self.power_ups.push(power_up);
        }
    }

    pub fn is_invulnerable(&self) -> bool {
        self.invulnerable_for > 0.0
    }

    pub fn update(&mut self, dt: f32) {
        self.invulnerable_for = (self.invulnerable_for - dt).max(0.0);
    }
}

#[derive(Debug, Default)]
struct PositionSamples {
    x: f32,
    y: f32,
    angle: f32,
    count: u32,
}

impl PositionSamples {
    fn add(&mut self, x: f32, y: f32, angle: f32) {
        self.x += x;
        self.y += y;
        self.angle += angle;
        self.count += 1;
    }

    fn average(&self) -> Option<(f32, f32, f32)> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f32;
        Some((self.x / n, self.y / n, self.angle / n))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    RemoteDied,
    PeerClosed,
    /// The link failed underneath the game
    Lost,
}

/// Consumes up to [`MAX_LINES_PER_TICK`] received lines.
pub fn reconcile<A>(adapter: &mut A, remote: &mut RemotePlayer) -> TickOutcome
where
    A: NetworkAdapter + ?Sized,
{
    let mut samples = PositionSamples::default();
    let mut outcome = TickOutcome::Continue;

    for _ in 0..MAX_LINES_PER_TICK {
        let Some(line) = adapter.receive() else {
            break;
        };

        match GameMessage::parse(&line) {
            Ok(GameMessage::PlayerPos { x, y, angle }) => samples.add(x, y, angle),
            Ok(GameMessage::PlayerShot) => remote.fire(),
            Ok(GameMessage::PlayerHit) => {
                if !remote.take_hit() {
                    debug!("Hit ignored, remote is invulnerable");
                }
            }
            Ok(GameMessage::PlayerPowerUp(id)) => match PowerUp::from_id(&id) {
                Some(power_up) => remote.grant(power_up),
                None => warn!("Unknown power-up {}", id),
            },
            Ok(GameMessage::PlayerDead) => {
                remote.removed = true;
                outcome = TickOutcome::RemoteDied;
                break;
            }
            Ok(GameMessage::Close) | Ok(GameMessage::ConnectionLost) => {
                outcome = TickOutcome::PeerClosed;
                break;
            }
            Err(e) => warn!("Ignoring {:?}: {}", line, e),
        }
    }

    if let Some((x, y, angle)) = samples.average() {
        remote.x = x;
        remote.y = y;
        remote.angle = angle;
    }

    outcome
}

/// One game against one peer, driven from the game loop
pub struct GameSession<A: NetworkAdapter> {
    adapter: A,
    remote: RemotePlayer,
}

impl<A: NetworkAdapter> GameSession<A> {
    pub fn new(adapter: A) -> Self {
        Self {
            adapter,
            remote: RemotePlayer::default(),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn adapter_mut(&mut self) -> &mut A {
        &mut self.adapter
    }

    pub fn remote(&self) -> &RemotePlayer {
        &self.remote
    }

    pub fn send(&mut self, message: &GameMessage) -> bool {
        self.adapter.send(&message.to_string())
    }

    /// Advances the adapter, then applies what the peer sent.
    pub fn tick(&mut self, dt: f32) -> TickOutcome {
        let was_playing = self.adapter.state() == AdapterState::Game;
        self.adapter.update_state(dt);

        match self.adapter.state() {
            AdapterState::Game => {}
            AdapterState::Failure if was_playing => return TickOutcome::Lost,
            _ if was_playing => return TickOutcome::PeerClosed,
            _ => return TickOutcome::Continue,
        }
        if !was_playing {
            self.remote = RemotePlayer::default();
        }

        self.remote.update(dt);
        let outcome = reconcile(&mut self.adapter, &mut self.remote);
        if outcome != TickOutcome::Continue {
            info!("Session over: {:?}", outcome);
            self.disconnect();
        }
        outcome
    }

    /// Tells the peer we are leaving, then releases every network resource.
    pub fn disconnect(&mut self) {
        if self.adapter.state() == AdapterState::Game && !self.adapter.send(CLOSE_LINE) {
            debug!("Close not queued");
        }
        self.adapter.reset();
    }

    pub fn into_adapter(self) -> A {
        self.adapter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use shared::Host;
    use std::collections::VecDeque;

    /// Adapter double that replays queued lines and records the rest
    struct ScriptedAdapter {
        state: AdapterState,
        inbound: VecDeque<String>,
        sent: Vec<String>,
        resets: u32,
        /// State the next update_state moves to
        next_state: Option<AdapterState>,
    }

    impl ScriptedAdapter {
        fn playing(lines: &[&str]) -> Self {
            Self {
                state: AdapterState::Game,
                inbound: lines.iter().map(|l| l.to_string()).collect(),
                sent: Vec::new(),
                resets: 0,
                next_state: None,
            }
        }
    }

    impl NetworkAdapter for ScriptedAdapter {
        fn update_state(&mut self, _dt: f32) {
            if let Some(next) = self.next_state.take() {
                self.state = next;
            }
        }
        fn update_hosts(&mut self) {}
        fn stop_host_update(&mut self) {}
        fn get_hosts(&mut self, out: &mut Vec<Host>) {
            out.clear();
        }
        fn register(&mut self, _nickname: &str, _timeout_secs: u32, _data: &str) {}
        fn connect(&mut self, _host: &Host) {}

        fn reset(&mut self) {
            self.resets += 1;
            self.inbound.clear();
            self.state = AdapterState::Idle;
        }

        fn send(&mut self, line: &str) -> bool {
            self.sent.push(line.to_string());
            true
        }

        fn receive(&mut self) -> Option<String> {
            self.inbound.pop_front()
        }

        fn state(&self) -> AdapterState {
            self.state
        }

        fn data(&self) -> Option<&str> {
            None
        }

        fn failure_reason(&self) -> Option<&str> {
            None
        }
    }

    #[test]
    fn test_positions_are_averaged_per_tick() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_POS 10 20 0.5", "PLAYER_POS 20 40 1.5"]);
        let mut remote = RemotePlayer::default();

        assert_eq!(reconcile(&mut adapter, &mut remote), TickOutcome::Continue);
        assert_approx_eq!(remote.x, 15.0);
        assert_approx_eq!(remote.y, 30.0);
        assert_approx_eq!(remote.angle, 1.0);
    }

    #[test]
    fn test_no_positions_keeps_last_known() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_SHOT"]);
        let mut remote = RemotePlayer {
            x: 5.0,
            y: 6.0,
            ..RemotePlayer::default()
        };

        reconcile(&mut adapter, &mut remote);
        assert_approx_eq!(remote.x, 5.0);
        assert_approx_eq!(remote.y, 6.0);
        assert_eq!(remote.shots_fired, 1);
    }

    #[test]
    fn test_death_stops_the_drain() {
        let mut adapter =
            ScriptedAdapter::playing(&["PLAYER_SHOT", "PLAYER_DEAD", "PLAYER_SHOT", "PLAYER_POS 1 1 1"]);
        let mut remote = RemotePlayer::default();

        assert_eq!(reconcile(&mut adapter, &mut remote), TickOutcome::RemoteDied);
        assert!(remote.removed);
        assert_eq!(remote.shots_fired, 1);
        assert_eq!(adapter.inbound.len(), 2);
    }

    #[test]
    fn test_close_stops_the_drain() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_POS 2 4 0", "CLOSE", "PLAYER_HIT"]);
        let mut remote = RemotePlayer::default();

        assert_eq!(reconcile(&mut adapter, &mut remote), TickOutcome::PeerClosed);
        assert_approx_eq!(remote.x, 2.0);
        assert_eq!(remote.hits_taken, 0);
    }

    #[test]
    fn test_hits_respect_invulnerability() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_HIT", "PLAYER_HIT"]);
        let mut remote = RemotePlayer::default();

        reconcile(&mut adapter, &mut remote);
        assert_eq!(remote.hits_taken, 1);
        assert!(remote.is_invulnerable());

        remote.update(HIT_INVULNERABILITY + 0.1);
        assert!(!remote.is_invulnerable());
        assert!(remote.take_hit());
        assert_eq!(remote.hits_taken, 2);
    }

    #[test]
    fn test_power_ups() {
        let mut adapter =
            ScriptedAdapter::playing(&["PLAYER_PWUP SHIELD", "PLAYER_PWUP BANANA", "PLAYER_PWUP SHIELD", "PLAYER_PWUP SPEED"]);
        let mut remote = RemotePlayer::default();

        reconcile(&mut adapter, &mut remote);
        assert_eq!(remote.power_ups, vec![PowerUp::Shield, PowerUp::Speed]);
        assert_eq!(PowerUp::from_id(PowerUp::DoubleShot.id()), Some(PowerUp::DoubleShot));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let mut adapter = ScriptedAdapter::playing(&["", "JUMP", "PLAYER_POS 1 x 0", "PLAYER_POS 3 3 3"]);
        let mut remote = RemotePlayer::default();

        assert_eq!(reconcile(&mut adapter, &mut remote), TickOutcome::Continue);
        assert_approx_eq!(remote.x, 3.0);
    }

    #[test]
    fn test_drain_is_bounded() {
        let lines: Vec<String> = (0..MAX_LINES_PER_TICK + 10).map(|_| "PLAYER_SHOT".to_string()).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let mut adapter = ScriptedAdapter::playing(&refs);
        let mut remote = RemotePlayer::default();

        reconcile(&mut adapter, &mut remote);
        assert_eq!(remote.shots_fired as usize, MAX_LINES_PER_TICK);
        assert_eq!(adapter.inbound.len(), 10);
    }

    #[test]
    fn test_session_disconnects_on_death() {
        let mut session = GameSession::new(ScriptedAdapter::playing(&["PLAYER_DEAD"]));

        assert_eq!(session.tick(1.0 / 60.0), TickOutcome::RemoteDied);
        assert!(session.remote().removed);

        let adapter = session.into_adapter();
        assert_eq!(adapter.sent, vec![CLOSE_LINE.to_string()]);
        assert_eq!(adapter.resets, 1);
        assert_eq!(adapter.state, AdapterState::Idle);
    }

    #[test]
    fn test_session_idle_outside_game() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_SHOT"]);
        adapter.state = AdapterState::Waiting;
        let mut session = GameSession::new(adapter);

        assert_eq!(session.tick(0.1), TickOutcome::Continue);
        assert_eq!(session.remote().shots_fired, 0);
        assert_eq!(session.adapter().inbound.len(), 1);
    }

    #[test]
    fn test_session_starts_when_game_begins() {
        let mut adapter = ScriptedAdapter::playing(&["PLAYER_POS 8 9 0"]);
        adapter.state = AdapterState::Finalizing;
        adapter.next_state = Some(AdapterState::Game);
        let mut session = GameSession::new(adapter);

        assert_eq!(session.tick(0.1), TickOutcome::Continue);
        assert_approx_eq!(session.remote().x, 8.0);
    }

    #[test]
    fn test_session_reports_lost_link() {
        let mut adapter = ScriptedAdapter::playing(&[]);
        adapter.next_state = Some(AdapterState::Failure);
        let mut session = GameSession::new(adapter);

        assert_eq!(session.tick(0.1), TickOutcome::Lost);
    }

    #[test]
    fn test_session_reports_clean_close() {
        let mut adapter = ScriptedAdapter::playing(&[]);
        adapter.next_state = Some(AdapterState::Idle);
        let mut session = GameSession::new(adapter);

        assert_eq!(session.tick(0.1), TickOutcome::PeerClosed);
        assert!(session.adapter().sent.is_empty());
    }
}
