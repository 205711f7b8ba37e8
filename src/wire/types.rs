//! Common wire types

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Final decision handed back to the kernel queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Drop,
    Accept,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Drop => write!(f, "drop"),
            Verdict::Accept => write!(f, "accept"),
        }
    }
}

/// Verdict code carried in a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerdictCode {
    /// Decision process has not decided yet
    None,
    Drop,
    Accept,
    /// Anything else on the wire
    Invalid(u32),
}

impl VerdictCode {
    pub const NONE: u32 = 0x00;
    pub const DROP: u32 = 0x01;
    pub const ACCEPT: u32 = 0x02;

    pub fn from_u32(value: u32) -> Self {
        match value {
            Self::NONE => VerdictCode::None,
            Self::DROP => VerdictCode::Drop,
            Self::ACCEPT => VerdictCode::Accept,
            other => VerdictCode::Invalid(other),
        }
    }

    pub fn as_u32(&self) -> u32 {
        match self {
            VerdictCode::None => Self::NONE,
            VerdictCode::Drop => Self::DROP,
            VerdictCode::Accept => Self::ACCEPT,
            VerdictCode::Invalid(v) => *v,
        }
    }

    /// The verdict this code settles on, if it settles on one
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            VerdictCode::Drop => Some(Verdict::Drop),
            VerdictCode::Accept => Some(Verdict::Accept),
            VerdictCode::None | VerdictCode::Invalid(_) => None,
        }
    }
}

impl From<Verdict> for VerdictCode {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Drop => VerdictCode::Drop,
            Verdict::Accept => VerdictCode::Accept,
        }
    }
}

/// Capture timestamp as the kernel reports it (seconds + microseconds)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn new(sec: i64, usec: i64) -> Self {
        Self { sec, usec }
    }
}

impl From<SystemTime> for Timeval {
    fn from(time: SystemTime) -> Self {
        let since_epoch = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        Self {
            sec: since_epoch.as_secs() as i64,
            usec: since_epoch.subsec_micros() as i64,
        }
    }
}

impl fmt::Display for Timeval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}
