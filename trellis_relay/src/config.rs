// Configuration for the relay process and the client adapter.
//
// `RelayConfig` starts from `Default`, is overlaid from the process
// environment (`apply_env`), and finally from command-line flags in
// `main.rs`. The environment names are the ones operators already deploy
// with:
//
//   RELAY_PORT          listen port advertised to clients
//   RELAY_ADDRESS       public host name advertised in `SessionInfo`
//   JOIN_CODE_LENGTH    characters per generated join code (positive)
//   ENABLE_DESTROY_API  "true" / "t" / "1" enables destroy; any other value
//                       disables it; unset leaves it enabled
//
// `apply_env` takes a lookup closure rather than reading `std::env`
// directly, so tests can feed it a map.
//
// `ClientConfig` holds the adapter's knobs (see `client.rs`). Its simulated
// network conditions never touch the wire; they only perturb local delivery.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use trellis_protocol::types::MAX_JOIN_CODE_LEN;

use crate::conditions::SimulatedConditions;
use crate::error::ConfigError;

pub const DEFAULT_RELAY_PORT: u16 = 15593;
pub const DEFAULT_JOIN_CODE_LENGTH: usize = 6;

/// Timing and queueing for one framed peer link. Shared by both ends.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// How often an idle link sends a ping.
    pub ping_interval: Duration,
    /// Silence after which the peer is considered gone.
    pub disconnect_timeout: Duration,
    /// Frames buffered per peer before sends start failing.
    pub outbound_queue: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
            outbound_queue: 1024,
        }
    }
}

impl LinkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("ping interval"));
        }
        if self.disconnect_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("disconnect timeout"));
        }
        if self.ping_interval >= self.disconnect_timeout {
            return Err(ConfigError::PingInterval {
                ping: self.ping_interval,
                timeout: self.disconnect_timeout,
            });
        }
        Ok(())
    }
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Address clients are told to connect to.
    pub public_address: String,
    pub join_code_length: usize,
    pub enable_destroy_api: bool,
    /// How long a session may sit with no members before the sweep drops it.
    pub empty_session_grace: Duration,
    pub sweep_interval: Duration,
    /// How long a new connection has, from accept, to present its join
    /// request. Pings do not extend it.
    pub handshake_timeout: Duration,
    pub link: LinkConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_RELAY_PORT,
            public_address: "127.0.0.1".into(),
            join_code_length: DEFAULT_JOIN_CODE_LENGTH,
            enable_destroy_api: true,
            empty_session_grace: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            link: LinkConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay settings found through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("RELAY_PORT") {
            self.port = raw
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(raw.clone()))?;
        }
        if let Some(raw) = lookup("RELAY_ADDRESS") {
            self.public_address = raw;
        }
        if let Some(raw) = lookup("JOIN_CODE_LENGTH") {
            self.join_code_length = parse_join_code_length(&raw)?;
        }
        if let Some(raw) = lookup("ENABLE_DESTROY_API") {
            self.enable_destroy_api = matches!(raw.trim(), "true" | "t" | "1");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join_code_length == 0 || self.join_code_length > MAX_JOIN_CODE_LEN {
            return Err(ConfigError::InvalidJoinCodeLength(
                self.join_code_length.to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroDuration("sweep interval"));
        }
        if self.handshake_timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("handshake timeout"));
        }
        self.link.validate()
    }
}

/// Parse a join code length, refusing zero, negatives and non-numbers.
pub fn parse_join_code_length(raw: &str) -> Result<usize, ConfigError> {
    let invalid = || ConfigError::InvalidJoinCodeLength(raw.to_string());
    let value: i64 = raw.trim().parse().map_err(|_| invalid())?;
    if value <= 0 || value as usize > MAX_JOIN_CODE_LEN {
        return Err(invalid());
    }
    Ok(value as usize)
}

/// Settings for a `RelayAdapter`.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub relay_address: String,
    pub relay_port: u16,
    /// Link timing for the TCP transport. Read by `TcpTransport::for_client`
    /// (and so by `RelayAdapter::connect_tcp`); a transport passed to
    /// `RelayAdapter::connect` keeps its own settings.
    pub ping_interval: Duration,
    pub disconnect_timeout: Duration,
    /// Pause between failed connection attempts.
    pub reconnect_delay: Duration,
    pub max_connect_attempts: u32,
    /// Capacity of the local event queue drained by `RelayAdapter::poll`.
    pub event_queue_capacity: usize,
    pub conditions: SimulatedConditions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_address: "127.0.0.1".into(),
            relay_port: DEFAULT_RELAY_PORT,
            ping_interval: Duration::from_secs(1),
            disconnect_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(500),
            max_connect_attempts: 10,
            event_queue_capacity: 1024,
            conditions: SimulatedConditions::default(),
        }
    }
}

impl ClientConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.relay_address, self.relay_port)
    }

    /// Clamp out-of-range values the way an editor inspector would: loss
    /// capped at 100, max latency raised to at least min latency, at least
    /// one connect attempt.
    pub fn sanitized(mut self) -> Self {
        self.conditions.loss_percent = self.conditions.loss_percent.min(100);
        self.conditions.max_latency = self.conditions.max_latency.max(self.conditions.min_latency);
        self.max_connect_attempts = self.max_connect_attempts.max(1);
        self.event_queue_capacity = self.event_queue_capacity.max(1);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_connect_attempts == 0 {
            return Err(ConfigError::NoConnectAttempts);
        }
        self.conditions.validate()?;
        self.link_config().validate()
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            ping_interval: self.ping_interval,
            disconnect_timeout: self.disconnect_timeout,
            ..LinkConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overlay_reads_known_keys() {
        let vars = env(&[
            ("RELAY_PORT", "4000"),
            ("RELAY_ADDRESS", "relay.example.net"),
            ("JOIN_CODE_LENGTH", "8"),
            ("ENABLE_DESTROY_API", "0"),
        ]);
        let mut config = RelayConfig::default();
        config.apply_env(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.port, 4000);
        assert_eq!(config.public_address, "relay.example.net");
        assert_eq!(config.join_code_length, 8);
        assert!(!config.enable_destroy_api);
    }

    #[test]
    fn destroy_api_enabled_by_default_and_by_truthy_values() {
        assert!(RelayConfig::default().enable_destroy_api);
        for value in ["true", "t", "1"] {
            let vars = env(&[("ENABLE_DESTROY_API", value)]);
            let mut config = RelayConfig::default();
            config.enable_destroy_api = false;
            config.apply_env(|k| vars.get(k).cloned()).unwrap();
            assert!(config.enable_destroy_api, "{value} should enable destroy");
        }
    }

    #[test]
    fn non_positive_join_code_length_rejected() {
        for raw in ["0", "-3", "six", ""] {
            let vars = env(&[("JOIN_CODE_LENGTH", raw)]);
            let mut config = RelayConfig::default();
            let err = config.apply_env(|k| vars.get(k).cloned()).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidJoinCodeLength(_)), "{raw}");
            assert_eq!(config.join_code_length, DEFAULT_JOIN_CODE_LENGTH);
        }
    }

    #[test]
    fn bad_port_rejected() {
        let vars = env(&[("RELAY_PORT", "99999")]);
        let mut config = RelayConfig::default();
        assert!(matches!(
            config.apply_env(|k| vars.get(k).cloned()),
            Err(ConfigError::InvalidPort(_))
        ));
    }

    #[test]
    fn validate_catches_zero_length_set_directly() {
        let config = RelayConfig {
            join_code_length: 0,
            ..RelayConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(RelayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_handshake_timeout_rejected() {
        let config = RelayConfig {
            handshake_timeout: Duration::ZERO,
            ..RelayConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroDuration("handshake timeout"))
        ));
    }

    #[test]
    fn client_sanitize_clamps_conditions() {
        let mut config = ClientConfig::default();
        config.conditions.loss_percent = 150;
        config.conditions.min_latency = Duration::from_millis(80);
        config.conditions.max_latency = Duration::from_millis(20);
        config.max_connect_attempts = 0;

        assert!(config.validate().is_err());
        let config = config.sanitized();
        assert_eq!(config.conditions.loss_percent, 100);
        assert_eq!(config.conditions.max_latency, Duration::from_millis(80));
        assert_eq!(config.max_connect_attempts, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn client_endpoint_joins_host_and_port() {
        let config = ClientConfig {
            relay_address: "10.0.0.2".into(),
            relay_port: 7777,
            ..ClientConfig::default()
        };
        assert_eq!(config.endpoint(), "10.0.0.2:7777");
    }
}
