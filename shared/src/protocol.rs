//! Rendezvous server line grammar.
//!
//! One command line goes out per exchange and one response line comes back,
//! except for `LIST`, whose response is a `LIST_BEGIN` .. `LIST_END` block of
//! host entries (see [`crate::Host::parse_entry`]).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register {
        nickname: String,
        timeout_ms: u64,
        data: String,
    },
    Connect {
        cookie: String,
    },
    /// `STATUS` on a retained guest socket, `STATUS <cookie>` from a host.
    Status {
        cookie: Option<String>,
    },
    Ready,
    List,
    Close {
        cookie: String,
    },
}

impl Request {
    pub fn parse(line: &str) -> Option<Request> {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "REGISTER" => {
                let mut parts = rest.splitn(3, ' ');
                let nickname = parts.next().filter(|s| !s.is_empty())?;
                let timeout_ms = parts.next()?.parse().ok()?;
                let data = parts.next().unwrap_or("").trim();
                Some(Request::Register {
                    nickname: nickname.to_string(),
                    timeout_ms,
                    data: data.to_string(),
                })
            }
            "CONNECT" if !rest.is_empty() => Some(Request::Connect {
                cookie: rest.to_string(),
            }),
            "STATUS" => Some(Request::Status {
                cookie: (!rest.is_empty()).then(|| rest.to_string()),
            }),
            "READY" if rest.is_empty() => Some(Request::Ready),
            "LIST" if rest.is_empty() => Some(Request::List),
            "CLOSE" if !rest.is_empty() => Some(Request::Close {
                cookie: rest.to_string(),
            }),
            _ => None,
        }
    }
}

fn breaks_line(value: &str) -> bool {
    value.contains(['\r', '\n'])
}

impl Request {
    /// False when a field would split the command over several lines.
    pub fn is_single_line(&self) -> bool {
        match self {
            Request::Register { nickname, data, .. } => !breaks_line(nickname) && !breaks_line(data),
            Request::Connect { cookie }
            | Request::Close { cookie }
            | Request::Status {
                cookie: Some(cookie),
            } => !breaks_line(cookie),
            Request::Status { cookie: None } | Request::Ready | Request::List => true,
        }
    }
}

/// Writes a field with any line break flattened to a space.
struct Field<'a>(&'a str);

impl fmt::Display for Field<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !breaks_line(self.0) {
            return f.write_str(self.0);
        }
        let flat: String = self
            .0
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        f.write_str(&flat)
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Register {
                nickname,
                timeout_ms,
                data,
            } if data.is_empty() => write!(f, "REGISTER {} {}", Field(nickname), timeout_ms),
            Request::Register {
                nickname,
                timeout_ms,
                data,
            } => write!(
                f,
                "REGISTER {} {} {}",
                Field(nickname),
                timeout_ms,
                Field(data)
            ),
            Request::Connect { cookie } => write!(f, "CONNECT {}", Field(cookie)),
            Request::Status { cookie: None } => write!(f, "STATUS"),
            Request::Status {
                cookie: Some(cookie),
            } => write!(f, "STATUS {}", Field(cookie)),
            Request::Ready => write!(f, "READY"),
            Request::List => write!(f, "LIST"),
            Request::Close { cookie } => write!(f, "CLOSE {}", Field(cookie)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `OK` after `CONNECT`, `OK <cookie>` after `REGISTER`.
    Ok(Option<String>),
    Waiting,
    Matched,
    GameReady,
    ListBegin,
    ListEnd,
    Error(String),
}

impl Response {
    pub fn parse(line: &str) -> Option<Response> {
        let line = line.trim();
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match (command, rest.is_empty()) {
            ("OK", true) => Some(Response::Ok(None)),
            ("OK", false) => Some(Response::Ok(Some(rest.to_string()))),
            ("WAITING", true) => Some(Response::Waiting),
            ("MATCHED", true) => Some(Response::Matched),
            ("GAME_READY", true) => Some(Response::GameReady),
            ("LIST_BEGIN", true) => Some(Response::ListBegin),
            ("LIST_END", true) => Some(Response::ListEnd),
            ("ERROR", _) => Some(Response::Error(rest.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Response::Ok(None) => write!(f, "OK"),
            Response::Ok(Some(cookie)) => write!(f, "OK {}", cookie),
            Response::Waiting => write!(f, "WAITING"),
            Response::Matched => write!(f, "MATCHED"),
            Response::GameReady => write!(f, "GAME_READY"),
            Response::ListBegin => write!(f, "LIST_BEGIN"),
            Response::ListEnd => write!(f, "LIST_END"),
            Response::Error(reason) => write!(f, "ERROR {}", reason),
        }
    }
}
