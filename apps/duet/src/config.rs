use std::env;
use std::time::Duration;

use duet_proto::chunk::DEFAULT_CHUNK_BYTES;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Timing and sizing knobs of one lesson session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<String>,
    /// Wait before tearing down after the relay reports the peer gone.
    pub peer_left_grace: Duration,
    /// Wait-and-see window after ICE reports `disconnected`.
    pub disconnect_grace: Duration,
    pub max_ice_restarts: u32,
    pub restart_backoff_base: Duration,
    pub restart_timeout: Duration,
    pub negotiation_timeout: Duration,
    /// How long a non-initiator waits for an offer before offering itself.
    pub offer_wait: Duration,
    pub max_full_reconnects: u32,
    pub signaling_backoff_base: Duration,
    pub signaling_backoff_cap: Duration,
    pub heartbeat_interval: Duration,
    pub pong_timeout: Duration,
    pub sleep_threshold: Duration,
    /// Bound of the chat, control and file-control send queues.
    pub channel_queue_capacity: usize,
    /// Bound of the whiteboard send queue, sized for a burst of strokes.
    pub whiteboard_queue_capacity: usize,
    pub seen_message_window: usize,
    pub chunk_bytes: usize,
    pub high_water_mark: usize,
    pub capacity_wait: Duration,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if env_flag("DUET_DISABLE_STUN") {
            Vec::new()
        } else {
            env::var("DUET_ICE_SERVERS")
                .ok()
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|entry| !entry.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers.clone())
        };
        let chunk_bytes = env_parse("DUET_CHUNK_BYTES").unwrap_or(defaults.chunk_bytes);

        Self {
            signaling_url: env::var("DUET_SIGNALING_URL").unwrap_or(defaults.signaling_url),
            ice_servers,
            heartbeat_interval: env_secs("DUET_HEARTBEAT_SECS")
                .unwrap_or(defaults.heartbeat_interval),
            pong_timeout: env_secs("DUET_PONG_TIMEOUT_SECS").unwrap_or(defaults.pong_timeout),
            channel_queue_capacity: env_parse("DUET_CHANNEL_QUEUE")
                .unwrap_or(defaults.channel_queue_capacity),
            whiteboard_queue_capacity: env_parse("DUET_WHITEBOARD_QUEUE")
                .unwrap_or(defaults.whiteboard_queue_capacity),
            high_water_mark: chunk_bytes.saturating_mul(4),
            chunk_bytes,
            ..defaults
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            peer_left_grace: Duration::from_secs(2),
            disconnect_grace: Duration::from_secs(3),
            max_ice_restarts: 3,
            restart_backoff_base: Duration::from_secs(1),
            restart_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(30),
            offer_wait: Duration::from_secs(10),
            max_full_reconnects: 1,
            signaling_backoff_base: Duration::from_secs(1),
            signaling_backoff_cap: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(30),
            sleep_threshold: Duration::from_secs(60),
            channel_queue_capacity: 100,
            whiteboard_queue_capacity: 256,
            seen_message_window: 512,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            high_water_mark: DEFAULT_CHUNK_BYTES * 4,
            capacity_wait: Duration::from_secs(10),
        }
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test_timeout::timeout]
    fn env_overrides_apply() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::set_var("DUET_SIGNALING_URL", "ws://relay.test:9000");
            env::set_var("DUET_DISABLE_STUN", "1");
            env::set_var("DUET_CHUNK_BYTES", "1024");
            env::set_var("DUET_WHITEBOARD_QUEUE", "512");
        }
        let config = SessionConfig::from_env();
        unsafe {
            env::remove_var("DUET_SIGNALING_URL");
            env::remove_var("DUET_DISABLE_STUN");
            env::remove_var("DUET_CHUNK_BYTES");
            env::remove_var("DUET_WHITEBOARD_QUEUE");
        }
        assert_eq!(config.signaling_url, "ws://relay.test:9000");
        assert!(config.ice_servers.is_empty());
        assert_eq!(config.chunk_bytes, 1024);
        assert_eq!(config.high_water_mark, 4096);
        assert_eq!(config.channel_queue_capacity, 100);
        assert_eq!(config.whiteboard_queue_capacity, 512);
    }

    #[test_timeout::timeout]
    fn defaults_without_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe {
            env::remove_var("DUET_SIGNALING_URL");
            env::remove_var("DUET_ICE_SERVERS");
            env::remove_var("DUET_DISABLE_STUN");
        }
        let config = SessionConfig::from_env();
        assert_eq!(config.signaling_url, DEFAULT_SIGNALING_URL);
        assert_eq!(config.ice_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
        assert_eq!(config.whiteboard_queue_capacity, 256);
    }
}
