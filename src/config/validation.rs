//! Configuration validation

use super::{Config, FallbackVerdict};

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn warn(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn print_diagnostics(&self) {
        for warning in &self.warnings {
            println!("[WARN] {}", warning);
        }
        for error in &self.errors {
            println!("[ERROR] {}", error);
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::new()
    }
}

/// Validate configuration and return warnings/errors
pub fn validate(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_queue(config, &mut result);
    validate_channel(config, &mut result);
    validate_verdict(config, &mut result);
    validate_logging(config, &mut result);

    result
}

fn validate_queue(config: &Config, result: &mut ValidationResult) {
    let queue = &config.queue;

    if queue.copy_range == 0 {
        result.error("queue.copy_range: must be greater than 0");
    } else if queue.copy_range > 0xFFFF {
        result.error(format!(
            "queue.copy_range: {} exceeds the kernel maximum of 65535",
            queue.copy_range
        ));
    }

    if queue.poll_interval_ms == 0 {
        result.error("queue.poll_interval_ms: must be greater than 0");
    }
}

fn validate_channel(config: &Config, result: &mut ValidationResult) {
    let channel = &config.channel;

    if channel.socket_path.as_os_str().is_empty() {
        result.error("channel.socket_path: must not be empty");
    } else if channel.socket_path.as_os_str().len() >= 108 {
        // sun_path is 108 bytes including the terminator
        result.error(format!(
            "channel.socket_path: '{}' is too long for a unix socket",
            channel.socket_path.display()
        ));
    }

    match &channel.peer_path {
        Some(peer) if *peer == channel.socket_path => {
            result.error("channel.peer_path: must differ from channel.socket_path");
        }
        Some(_) => {}
        None => result.warn(
            "channel.peer_path: not set, requests fail open until the decision process sends a datagram",
        ),
    }
}

fn validate_verdict(config: &Config, result: &mut ValidationResult) {
    let verdict = &config.verdict;

    if verdict.timeout_ms == 0 {
        result.warn("verdict.timeout_ms: 0 waits forever, a dead decision process stalls all queued traffic");
    }

    if verdict.fallback == FallbackVerdict::Drop && config.queue.fail_open {
        result.warn("verdict.fallback: drop combined with queue.fail_open accepts packets only when the kernel queue overflows");
    }
}

fn validate_logging(config: &Config, result: &mut ValidationResult) {
    if !config.logging.is_known_level() {
        result.warn(format!(
            "logging.level: unknown level '{}', using info",
            config.logging.level
        ));
    }
    if !config.logging.is_known_format() {
        result.warn(format!(
            "logging.format: unknown format '{}', using pretty",
            config.logging.format
        ));
    }
}
