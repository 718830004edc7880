use std::env;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

const DEFAULT_INPUT_STREAM_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_DISPOSE_ADVERTISER_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_BRIDGE_ACCEPT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_LOG_FILTER: &str = "info,tether=debug";

/// Runtime knobs for browser and advertiser managers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetherConfig {
    /// How long a browser waits for the peer to open the stream back.
    pub input_stream_receive_timeout: Duration,
    /// How long a superseded advertiser generation stays reachable.
    pub dispose_advertiser_timeout: Duration,
    /// Host the local-socket bridges bind to and connect through.
    pub bridge_host: IpAddr,
    pub bridge_accept_timeout: Duration,
    pub log_filter: String,
}

impl TetherConfig {
    pub fn from_env() -> Self {
        let input_stream_receive_timeout = Duration::from_millis(
            env_millis("TETHER_INPUT_STREAM_TIMEOUT_MS").unwrap_or(DEFAULT_INPUT_STREAM_TIMEOUT_MS),
        );
        let dispose_advertiser_timeout = Duration::from_millis(
            env_millis("TETHER_DISPOSE_ADVERTISER_TIMEOUT_MS")
                .unwrap_or(DEFAULT_DISPOSE_ADVERTISER_TIMEOUT_MS),
        );
        let bridge_host = env::var("TETHER_BRIDGE_HOST")
            .ok()
            .and_then(|host| host.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let bridge_accept_timeout = Duration::from_millis(
            env_millis("TETHER_BRIDGE_ACCEPT_TIMEOUT_MS").unwrap_or(DEFAULT_BRIDGE_ACCEPT_TIMEOUT_MS),
        );
        let log_filter = env::var("RUST_LOG").unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
        Self {
            input_stream_receive_timeout,
            dispose_advertiser_timeout,
            bridge_host,
            bridge_accept_timeout,
            log_filter,
        }
    }

    pub fn with_input_stream_receive_timeout(mut self, timeout: Duration) -> Self {
        self.input_stream_receive_timeout = timeout;
        self
    }

    pub fn with_dispose_advertiser_timeout(mut self, timeout: Duration) -> Self {
        self.dispose_advertiser_timeout = timeout;
        self
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            input_stream_receive_timeout: Duration::from_millis(DEFAULT_INPUT_STREAM_TIMEOUT_MS),
            dispose_advertiser_timeout: Duration::from_millis(DEFAULT_DISPOSE_ADVERTISER_TIMEOUT_MS),
            bridge_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bridge_accept_timeout: Duration::from_millis(DEFAULT_BRIDGE_ACCEPT_TIMEOUT_MS),
            log_filter: DEFAULT_LOG_FILTER.into(),
        }
    }
}

fn env_millis(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}
