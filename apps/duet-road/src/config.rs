use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Sockets silent for longer than this are reaped.
    pub stale_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            stale_timeout: Duration::from_secs(120),
            reap_interval: Duration::from_secs(30),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env::var("DUET_ROAD_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            stale_timeout: env::var("DUET_ROAD_STALE_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_timeout),
            reap_interval: defaults.reap_interval,
        }
    }
}
