//! Session bookkeeping for the rendezvous server
//!
//! A session moves through three phases:
//! - `Waiting`: registered by a host, listed to prospective guests
//! - `GuestAttached`: a guest sent `CONNECT`, the host has not polled since
//! - `Matched`: the host observed the guest and both may finalize
//!
//! Hosts keep their session alive by polling; a session whose host stays
//! silent longer than its advertised timeout is swept.
//!
//! The registry is generic over the link type parked by the first side to
//! send `READY`, so it can be exercised without sockets.

use log::info;
use shared::Host;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Waiting,
    GuestAttached,
    Matched,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachError {
    UnknownSession,
    AlreadyTaken,
}

impl AttachError {
    pub fn reason(&self) -> &'static str {
        match self {
            AttachError::UnknownSession => "unknown session",
            AttachError::AlreadyTaken => "session already taken",
        }
    }
}

/// Result of one side announcing `READY`.
#[derive(Debug)]
pub enum ReadyOutcome<L> {
    /// First side: the link waits in the registry for its partner.
    Parked,
    /// Second side: the parked partner and the incoming link, in that
    /// order. The session is gone.
    Paired(L, L),
}

/// One registered session and its host's liveness
#[derive(Debug)]
pub struct Session<L> {
    pub cookie: String,
    pub nickname: String,
    pub data: String,
    pub timeout: Duration,
    pub last_seen: Instant,
    pub phase: SessionPhase,
    parked: Option<L>,
}

impl<L> Session<L> {
    pub fn new(cookie: String, nickname: &str, timeout: Duration, data: &str) -> Self {
        Self {
            cookie,
            nickname: nickname.to_string(),
            data: data.to_string(),
            timeout,
            last_seen: Instant::now(),
            phase: SessionPhase::Waiting,
            parked: None,
        }
    }

    /// Records host activity.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_timed_out(&self) -> bool {
        self.last_seen.elapsed() > self.timeout
    }

    pub fn to_host(&self) -> Host {
        Host::new(&self.nickname, &self.cookie, &self.data)
    }
}

/// All live sessions, keyed by cookie
///
/// Capacity is bounded so a misbehaving client cannot grow the table
/// without limit.
pub struct SessionRegistry<L> {
    sessions: HashMap<String, Session<L>>,
    max_sessions: usize,
}

impl<L> SessionRegistry<L> {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            max_sessions,
        }
    }

    /// Creates a session and returns its cookie, or None when full.
    ///
    /// A zero timeout falls back to the default.
    pub fn register(&mut self, nickname: &str, timeout: Duration, data: &str) -> Option<String> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }

        let cookie = loop {
            let candidate = format!("{:016x}", rand::random::<u64>());
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let timeout = if timeout.is_zero() {
            DEFAULT_SESSION_TIMEOUT
        } else {
            timeout
        };

        info!("Session {} registered by {}", cookie, nickname);
        self.sessions.insert(
            cookie.clone(),
            Session::new(cookie.clone(), nickname, timeout, data),
        );
        Some(cookie)
    }

    /// Sessions still open to guests, in no particular order
    pub fn list_waiting(&self) -> Vec<Host> {
        self.sessions
            .values()
            .filter(|session| session.phase == SessionPhase::Waiting)
            .map(Session::to_host)
            .collect()
    }

    pub fn attach_guest(&mut self, cookie: &str) -> Result<(), AttachError> {
        let session = self
            .sessions
            .get_mut(cookie)
            .ok_or(AttachError::UnknownSession)?;

        if session.phase != SessionPhase::Waiting {
            return Err(AttachError::AlreadyTaken);
        }

        session.phase = SessionPhase::GuestAttached;
        info!("Guest attached to session {}", cookie);
        Ok(())
    }

    /// Reopens a session whose guest left before the match completed.
    pub fn detach_guest(&mut self, cookie: &str) {
        if let Some(session) = self.sessions.get_mut(cookie) {
            if session.phase == SessionPhase::GuestAttached {
                session.phase = SessionPhase::Waiting;
                info!("Guest left session {}", cookie);
            }
        }
    }

    /// Host poll. Returns whether a guest is there, None for unknown cookies.
    ///
    /// The first poll that sees the guest moves the session to `Matched`.
    pub fn host_status(&mut self, cookie: &str) -> Option<bool> {
        let session = self.sessions.get_mut(cookie)?;
        session.touch();

        match session.phase {
            SessionPhase::Waiting => Some(false),
            SessionPhase::GuestAttached | SessionPhase::Matched => {
                session.phase = SessionPhase::Matched;
                Some(true)
            }
        }
    }

    /// Guest poll. True once the host has seen the match.
    pub fn guest_status(&self, cookie: &str) -> Option<bool> {
        self.sessions
            .get(cookie)
            .map(|session| session.phase == SessionPhase::Matched)
    }

    /// Parks the first ready link or pairs it with the parked one.
    ///
    /// The link is handed back when the session is unknown or not matched.
    pub fn ready(&mut self, cookie: &str, link: L) -> Result<ReadyOutcome<L>, L> {
        let Some(session) = self.sessions.get_mut(cookie) else {
            return Err(link);
        };
        if session.phase != SessionPhase::Matched {
            return Err(link);
        }

        session.touch();
        match session.parked.take() {
            None => {
                session.parked = Some(link);
                Ok(ReadyOutcome::Parked)
            }
            Some(partner) => {
                self.sessions.remove(cookie);
                info!("Session {} paired", cookie);
                Ok(ReadyOutcome::Paired(partner, link))
            }
        }
    }

    pub fn remove(&mut self, cookie: &str) -> bool {
        if self.sessions.remove(cookie).is_some() {
            info!("Session {} closed", cookie);
            true
        } else {
            false
        }
    }

    pub fn phase(&self, cookie: &str) -> Option<SessionPhase> {
        self.sessions.get(cookie).map(|session| session.phase)
    }

    /// Removes sessions whose host went silent and returns their cookies
    pub fn check_timeouts(&mut self) -> Vec<String> {
        let timed_out: Vec<String> = self
            .sessions
            .values()
            .filter(|session| session.is_timed_out())
            .map(|session| session.cookie.clone())
            .collect();

        for cookie in &timed_out {
            self.sessions.remove(cookie);
            info!("Session {} timed out", cookie);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
