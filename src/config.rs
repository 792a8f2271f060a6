//! Broker daemon configuration: YAML file over defaults.

use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};

fn parse_duration(text: &str, what: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(text).with_context(|| format!("invalid {what} duration '{text}'"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// TCP listen address.
    pub listen_addr: String,
    /// TLS material; plain TCP when absent.
    pub tls: Option<TlsConfig>,
    /// Concurrency cap of the backend execution queue.
    pub queue_concurrency: usize,
    /// Bound of each peer's outbound dispatch queue.
    pub outbound_queue_capacity: usize,
    /// Demand the client-authentication handshake from v2+ peers.
    pub require_authentication: bool,
    pub authorization: Option<AuthorizationConfig>,
    pub conversation: ConversationTimeouts,
    /// Inbound ring capacity per conversation.
    pub pending_ring_capacity: usize,
    /// Delivery attempts per outbound conversation message.
    pub max_delivery_attempts: usize,
    pub proxy: ProxyConfig,
    pub http_client: HttpClientConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            listen_addr: "127.0.0.1:9632".into(),
            tls: None,
            queue_concurrency: 64,
            outbound_queue_capacity: 64,
            require_authentication: false,
            authorization: None,
            conversation: ConversationTimeouts::default(),
            pending_ring_capacity: 32,
            max_delivery_attempts: 5,
            proxy: ProxyConfig::default(),
            http_client: HttpClientConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub cert_path: String,
    pub key_path: String,
}

/// Demo authorization table; production deployments plug a real
/// authorization service instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub token_type: String,
    /// How long an authorized principal stays fresh, e.g. `15m`.
    pub freshness_interval: String,
    pub principals: Vec<PrincipalEntry>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        AuthorizationConfig {
            token_type: "SessionCookie".into(),
            freshness_interval: "15m".into(),
            principals: Vec::new(),
        }
    }
}

impl AuthorizationConfig {
    pub fn freshness(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.freshness_interval, "freshness-interval")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalEntry {
    pub token: String,
    pub sid: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub type_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationTimeouts {
    pub ack_timeout: String,
    pub msg_timeout: String,
    pub poll_timeout: String,
}

impl Default for ConversationTimeouts {
    fn default() -> Self {
        ConversationTimeouts {
            ack_timeout: "30s".into(),
            msg_timeout: "300s".into(),
            poll_timeout: "1s".into(),
        }
    }
}

impl ConversationTimeouts {
    pub fn ack(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.ack_timeout, "ack-timeout")
    }

    pub fn msg(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.msg_timeout, "msg-timeout")
    }

    pub fn poll(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.poll_timeout, "poll-timeout")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Upstream chunk-server endpoints, `host:port`.
    pub endpoints: Vec<String>,
    pub retries_per_endpoint: usize,
    pub retry_delay: String,
    pub cache_enabled: bool,
    pub cache_dir: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            endpoints: Vec::new(),
            retries_per_endpoint: 3,
            retry_delay: "200ms".into(),
            cache_enabled: false,
            cache_dir: None,
        }
    }
}

impl ProxyConfig {
    pub fn delay(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.retry_delay, "retry-delay")
    }
}

/// Timeouts handed to the HTTP-client collaborator; not consumed by the
/// broker core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpClientConfig {
    pub timeout_in_seconds_get: u64,
    pub timeout_in_seconds_other: u64,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        HttpClientConfig {
            timeout_in_seconds_get: 1800,
            timeout_in_seconds_other: 1800,
        }
    }
}

/// Load the config file, or the defaults when no path is given.
pub fn load(path: Option<&Path>) -> anyhow::Result<BrokerConfig> {
    let Some(path) = path else {
        return Ok(BrokerConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("cannot read config file '{}'", path.display()))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("cannot parse config file '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = BrokerConfig::default();
        assert_eq!(config.pending_ring_capacity, 32);
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(config.http_client.timeout_in_seconds_get, 1800);
        assert_eq!(config.conversation.ack().unwrap(), Duration::from_secs(30));
        assert_eq!(config.conversation.msg().unwrap(), Duration::from_secs(300));
    }

    #[test]
    fn partial_yaml_overrides_defaults() {
        let config: BrokerConfig = serde_yaml::from_str(
            "listen_addr: 0.0.0.0:7000\nconversation:\n  ack_timeout: 5s\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7000");
        assert_eq!(config.conversation.ack().unwrap(), Duration::from_secs(5));
        assert_eq!(config.conversation.msg().unwrap(), Duration::from_secs(300));
    }
}
