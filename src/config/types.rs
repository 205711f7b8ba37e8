//! Configuration types

use crate::telemetry::LogConfig;
use crate::wire::Verdict;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Well-known rendezvous path of the decision channel
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/fr_nf";

/// User-defined configuration (config.toml)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub verdict: VerdictConfig,
    #[serde(default)]
    pub logging: LogConfig,
}

/// Netfilter queue binding
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue number used in the `NFQUEUE --queue-num` rule
    pub num: u16,
    /// Bytes of each packet copied to user space
    pub copy_range: u32,
    /// Ask the kernel to accept packets instead of dropping them when the queue is full
    pub fail_open: bool,
    /// Receive timeout so the loop notices shutdown
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            num: 0,
            copy_range: 0xFFFF,
            fail_open: false,
            poll_interval_ms: 200,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Decision process channel
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Path the bridge binds
    pub socket_path: PathBuf,
    /// Path the decision process binds. When unset the bridge replies to
    /// whoever last sent it a datagram.
    pub peer_path: Option<PathBuf>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            peer_path: None,
        }
    }
}

/// Verdict used when no decision arrives in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackVerdict {
    #[default]
    Accept,
    Drop,
}

impl From<FallbackVerdict> for Verdict {
    fn from(fallback: FallbackVerdict) -> Self {
        match fallback {
            FallbackVerdict::Accept => Verdict::Accept,
            FallbackVerdict::Drop => Verdict::Drop,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerdictConfig {
    /// How long a packet may wait for its verdict; 0 waits forever
    pub timeout_ms: u64,
    pub fallback: FallbackVerdict,
}

impl Default for VerdictConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            fallback: FallbackVerdict::Accept,
        }
    }
}

impl VerdictConfig {
    pub fn timeout(&self) -> Option<Duration> {
        match self.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn fallback_verdict(&self) -> Verdict {
        self.fallback.into()
    }
}
