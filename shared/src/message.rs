//! In-game line protocol spoken once both peers reached the game state.

use std::fmt;
use thiserror::Error;

/// Written by a peer that is leaving; also ends the inbound worker.
pub const CLOSE_LINE: &str = "CLOSE";
/// Reserved sentinel that ends the inbound worker like [`CLOSE_LINE`].
pub const CONNECTION_LOST_LINE: &str = "CONNECTION LOST";

#[derive(Debug, Clone, PartialEq)]
pub enum GameMessage {
    PlayerPos { x: f32, y: f32, angle: f32 },
    PlayerShot,
    PlayerHit,
    PlayerDead,
    PlayerPowerUp(String),
    Close,
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MessageError {
    #[error("empty message")]
    Empty,
    #[error("unknown message {0}")]
    Unknown(String),
    #[error("missing field {0}")]
    MissingField(&'static str),
    #[error("invalid number {0:?}")]
    InvalidNumber(String),
}

impl GameMessage {
    pub fn parse(line: &str) -> Result<GameMessage, MessageError> {
        let line = line.trim();
        if line == CONNECTION_LOST_LINE {
            return Ok(GameMessage::ConnectionLost);
        }

        let mut tokens = line.split_whitespace();
        let command = tokens.next().ok_or(MessageError::Empty)?;

        match command {
            "PLAYER_POS" => {
                let x = parse_number(tokens.next(), "x")?;
                let y = parse_number(tokens.next(), "y")?;
                let angle = parse_number(tokens.next(), "angle")?;
                Ok(GameMessage::PlayerPos { x, y, angle })
            }
            "PLAYER_SHOT" => Ok(GameMessage::PlayerShot),
            "PLAYER_HIT" => Ok(GameMessage::PlayerHit),
            "PLAYER_DEAD" => Ok(GameMessage::PlayerDead),
            "PLAYER_PWUP" => tokens
                .next()
                .map(|id| GameMessage::PlayerPowerUp(id.to_string()))
                .ok_or(MessageError::MissingField("id")),
            "CLOSE" => Ok(GameMessage::Close),
            other => Err(MessageError::Unknown(other.to_string())),
        }
    }

    /// True for the two lines that end a session from the remote side.
    pub fn is_terminal(line: &str) -> bool {
        let line = line.trim();
        line == CLOSE_LINE || line == CONNECTION_LOST_LINE
    }
}

fn parse_number(token: Option<&str>, field: &'static str) -> Result<f32, MessageError> {
    let token = token.ok_or(MessageError::MissingField(field))?;
    match token.parse::<f32>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(MessageError::InvalidNumber(token.to_string())),
    }
}

impl fmt::Display for GameMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameMessage::PlayerPos { x, y, angle } => write!(f, "PLAYER_POS {} {} {}", x, y, angle),
            GameMessage::PlayerShot => write!(f, "PLAYER_SHOT"),
            GameMessage::PlayerHit => write!(f, "PLAYER_HIT"),
            GameMessage::PlayerDead => write!(f, "PLAYER_DEAD"),
            GameMessage::PlayerPowerUp(id) => write!(f, "PLAYER_PWUP {}", id),
            GameMessage::Close => write!(f, "{}", CLOSE_LINE),
            GameMessage::ConnectionLost => write!(f, "{}", CONNECTION_LOST_LINE),
        }
    }
}
