use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::ip_addr::IpAddress;

// Default configuration constants
pub const DEFAULT_LISTEN_PORT: u16 = 9999;
pub const DEFAULT_HEARTBEAT_MILLIS: u64 = 500;
pub const DEFAULT_DIRECT_TIMEOUT_MILLIS: u64 = 500;
pub const DEFAULT_INDIRECT_TIMEOUT_MILLIS: u64 = 1_500;
pub const DEFAULT_INDIRECT_COUNT: usize = 3;
pub const DEFAULT_DEAD_NODE_RETENTION_MILLIS: u64 = 30_000;
pub const DEFAULT_RESURRECTION_PERIOD: u32 = 25;
pub const DEFAULT_MAX_BROADCAST_BYTES: usize = 256;
pub const DEFAULT_MAX_DATAGRAM_BYTES: usize = 512;

/// Suspicion window defaults to this many heartbeat periods when not set
/// explicitly.
pub(crate) const SUSPICION_HEARTBEAT_FACTOR: u64 = 5;

/// Left records stay gossipable for this many heartbeat periods before they
/// are flushed.
pub(crate) const LEFT_FLUSH_HEARTBEAT_FACTOR: u64 = 4;

/// Scaling constant of the dissemination budget `ceil(lambda * log2(N + 1))`.
pub(crate) const EMIT_BUDGET_LAMBDA: f64 = 2.5;

/// Fallback wake-up period of the timeout reaper.
pub(crate) const REAPER_FALLBACK_MILLIS: u64 = 1_000;

/// Capacity of the receiver-side broadcast suppression cache.
pub(crate) const SEEN_BROADCAST_CACHE_SIZE: usize = 1_024;

/// Peers contacted directly for the terminal leave gossip.
pub(crate) const LEAVE_FANOUT: usize = 2;

pub(crate) const DEFAULT_CHANNEL_BUFFER_SIZE: usize = 100;
pub(crate) const MAX_RETRY_DELAY_SECS: u64 = 60;

const ENV_PREFIX: &str = "SCUTTLE_";

/// Address family the cluster runs on. Member addresses inside datagrams are
/// fixed-width, so every process in a cluster must agree on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    pub(crate) fn ip_len(&self) -> usize {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 16,
        }
    }

    pub(crate) fn wire_tag(&self) -> u8 {
        match self {
            IpFamily::V4 => 4,
            IpFamily::V6 => 6,
        }
    }

    pub(crate) fn matches(&self, ip: IpAddr) -> bool {
        matches!(
            (self, ip),
            (IpFamily::V4, IpAddr::V4(_)) | (IpFamily::V6, IpAddr::V6(_))
        )
    }
}

impl Default for IpFamily {
    fn default() -> Self {
        IpFamily::V4
    }
}

impl FromStr for IpFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "4" => Ok(IpFamily::V4),
            "6" => Ok(IpFamily::V6),
            other => Err(format!("ip family must be 4 or 6, got {other:?}")),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),

    #[error("listen ip {ip} does not match ip family {family:?}")]
    FamilyMismatch { ip: IpAddr, family: IpFamily },

    #[error("seed node {addr} does not match ip family {family:?}")]
    SeedFamilyMismatch { addr: SocketAddr, family: IpFamily },

    #[error("max broadcast of {broadcast} bytes cannot fit in a {datagram}-byte datagram")]
    BroadcastTooLarge { broadcast: usize, datagram: usize },

    #[error("max datagram of {0} bytes cannot carry a single member record")]
    DatagramTooSmall(usize),

    #[error("invalid value {value:?} for {var}: {reason}")]
    BadEnv {
        var: String,
        value: String,
        reason: String,
    },
}

/// Runtime configuration of one membership instance.
#[derive(Debug, Clone)]
pub struct ScuttleConfig {
    pub(crate) listen_ip: IpAddr,
    pub(crate) listen_port: u16,
    pub(crate) heartbeat: Duration,
    pub(crate) direct_timeout: Duration,
    pub(crate) indirect_timeout: Duration,
    pub(crate) indirect_count: usize,
    pub(crate) suspicion: Duration,
    pub(crate) dead_node_retention_millis: u64,
    pub(crate) resurrection_period: u32,
    pub(crate) max_broadcast_bytes: usize,
    pub(crate) max_datagram_bytes: usize,
    pub(crate) ip_family: IpFamily,
    pub(crate) seed_nodes: Vec<SocketAddr>,
}

impl ScuttleConfig {
    pub fn builder() -> ScuttleConfigBuilder {
        ScuttleConfigBuilder::default()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    pub fn ip_family(&self) -> IpFamily {
        self.ip_family
    }

    pub(crate) fn left_flush_millis(&self) -> u64 {
        self.heartbeat.as_millis() as u64 * LEFT_FLUSH_HEARTBEAT_FACTOR
    }
}

#[derive(Debug, Clone)]
pub struct ScuttleConfigBuilder {
    listen_ip: Option<IpAddr>,
    listen_port: u16,
    heartbeat: Duration,
    direct_timeout: Duration,
    indirect_timeout: Duration,
    indirect_count: usize,
    suspicion: Option<Duration>,
    dead_node_retention_millis: u64,
    resurrection_period: u32,
    max_broadcast_bytes: usize,
    max_datagram_bytes: usize,
    ip_family: IpFamily,
    seed_nodes: Vec<SocketAddr>,
}

impl Default for ScuttleConfigBuilder {
    fn default() -> Self {
        Self {
            listen_ip: None,
            listen_port: DEFAULT_LISTEN_PORT,
            heartbeat: Duration::from_millis(DEFAULT_HEARTBEAT_MILLIS),
            direct_timeout: Duration::from_millis(DEFAULT_DIRECT_TIMEOUT_MILLIS),
            indirect_timeout: Duration::from_millis(DEFAULT_INDIRECT_TIMEOUT_MILLIS),
            indirect_count: DEFAULT_INDIRECT_COUNT,
            suspicion: None,
            dead_node_retention_millis: DEFAULT_DEAD_NODE_RETENTION_MILLIS,
            resurrection_period: DEFAULT_RESURRECTION_PERIOD,
            max_broadcast_bytes: DEFAULT_MAX_BROADCAST_BYTES,
            max_datagram_bytes: DEFAULT_MAX_DATAGRAM_BYTES,
            ip_family: IpFamily::default(),
            seed_nodes: Vec::new(),
        }
    }
}

impl ScuttleConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen_ip(mut self, ip: impl Into<IpAddress>) -> Self {
        self.listen_ip = Some(ip.into().0);
        self
    }

    pub fn listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Deadline for the ack of a direct probe.
    pub fn direct_timeout(mut self, timeout: Duration) -> Self {
        self.direct_timeout = timeout;
        self
    }

    /// Deadline for any ack of the indirect probe round.
    pub fn indirect_timeout(mut self, timeout: Duration) -> Self {
        self.indirect_timeout = timeout;
        self
    }

    /// Number of relays asked to probe on our behalf after a direct timeout.
    pub fn indirect_count(mut self, count: usize) -> Self {
        self.indirect_count = count;
        self
    }

    /// How long a suspect is given to refute before it is declared dead.
    /// Defaults to five heartbeat periods.
    pub fn suspicion(mut self, window: Duration) -> Self {
        self.suspicion = Some(window);
        self
    }

    /// How long dead records are kept for resurrection and gossip.
    pub fn dead_node_retention_millis(mut self, millis: u64) -> Self {
        self.dead_node_retention_millis = millis;
        self
    }

    /// One dead node gets a resurrection probe every this many probe cycles.
    pub fn resurrection_period(mut self, cycles: u32) -> Self {
        self.resurrection_period = cycles;
        self
    }

    pub fn max_broadcast_bytes(mut self, bytes: usize) -> Self {
        self.max_broadcast_bytes = bytes;
        self
    }

    pub fn max_datagram_bytes(mut self, bytes: usize) -> Self {
        self.max_datagram_bytes = bytes;
        self
    }

    pub fn ip_family(mut self, family: IpFamily) -> Self {
        self.ip_family = family;
        self
    }

    pub fn seed_node(mut self, addr: SocketAddr) -> Self {
        self.seed_nodes.push(addr);
        self
    }

    pub fn seed_nodes(mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.seed_nodes.extend(addrs);
        self
    }

    /// Applies `SCUTTLE_*` environment variables over the current values.
    /// Unset variables leave the builder untouched.
    pub fn from_env(mut self) -> Result<Self, ConfigError> {
        if let Some(port) = env_parse::<u16>("LISTEN_PORT")? {
            self.listen_port = port;
        }
        if let Some(ip) = env_parse::<IpAddr>("LISTEN_IP")? {
            self.listen_ip = Some(ip);
        }
        if let Some(ms) = env_parse::<u64>("HEARTBEAT_MILLIS")? {
            self.heartbeat = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("DIRECT_TIMEOUT_MILLIS")? {
            self.direct_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("INDIRECT_TIMEOUT_MILLIS")? {
            self.indirect_timeout = Duration::from_millis(ms);
        }
        if let Some(count) = env_parse::<usize>("INDIRECT_COUNT")? {
            self.indirect_count = count;
        }
        if let Some(ms) = env_parse::<u64>("SUSPICION_MILLIS")? {
            self.suspicion = Some(Duration::from_millis(ms));
        }
        if let Some(ms) = env_parse::<u64>("DEAD_NODE_RETENTION_MILLIS")? {
            self.dead_node_retention_millis = ms;
        }
        if let Some(cycles) = env_parse::<u32>("RESURRECTION_PERIOD")? {
            self.resurrection_period = cycles;
        }
        if let Some(bytes) = env_parse::<usize>("MAX_BROADCAST_BYTES")? {
            self.max_broadcast_bytes = bytes;
        }
        if let Some(bytes) = env_parse::<usize>("MAX_DATAGRAM_BYTES")? {
            self.max_datagram_bytes = bytes;
        }
        if let Some(family) = env_parse::<IpFamily>("IP_FAMILY")? {
            self.ip_family = family;
        }
        if let Some(seeds) = env_var("SEED_NODES") {
            for part in seeds.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let addr = part.parse::<SocketAddr>().map_err(|e| ConfigError::BadEnv {
                    var: format!("{ENV_PREFIX}SEED_NODES"),
                    value: part.to_string(),
                    reason: e.to_string(),
                })?;
                self.seed_nodes.push(addr);
            }
        }
        Ok(self)
    }

    fn validate(config: &ScuttleConfig) -> Result<(), ConfigError> {
        if config.listen_port == 0 {
            return Err(ConfigError::Zero("listen port"));
        }
        if config.heartbeat.as_millis() == 0 {
            return Err(ConfigError::Zero("heartbeat interval"));
        }
        if config.direct_timeout.as_millis() == 0 {
            return Err(ConfigError::Zero("direct probe timeout"));
        }
        if config.indirect_timeout.as_millis() == 0 {
            return Err(ConfigError::Zero("indirect probe timeout"));
        }
        if config.indirect_count == 0 {
            return Err(ConfigError::Zero("indirect relay count"));
        }
        if config.suspicion.as_millis() == 0 {
            return Err(ConfigError::Zero("suspicion window"));
        }
        if config.resurrection_period == 0 {
            return Err(ConfigError::Zero("resurrection period"));
        }
        if !config.ip_family.matches(config.listen_ip) {
            return Err(ConfigError::FamilyMismatch {
                ip: config.listen_ip,
                family: config.ip_family,
            });
        }
        for seed in &config.seed_nodes {
            if !config.ip_family.matches(seed.ip()) {
                return Err(ConfigError::SeedFamilyMismatch {
                    addr: *seed,
                    family: config.ip_family,
                });
            }
        }

        let ip_len = config.ip_family.ip_len();
        let base = 11;
        let member_record = 9 + 2 * ip_len;
        let broadcast_overhead = 8 + ip_len;
        if config.max_datagram_bytes < base + member_record {
            return Err(ConfigError::DatagramTooSmall(config.max_datagram_bytes));
        }
        if base + broadcast_overhead + config.max_broadcast_bytes > config.max_datagram_bytes {
            return Err(ConfigError::BroadcastTooLarge {
                broadcast: config.max_broadcast_bytes,
                datagram: config.max_datagram_bytes,
            });
        }
        Ok(())
    }

    pub fn build(self) -> Result<ScuttleConfig, ConfigError> {
        let listen_ip = match self.listen_ip {
            Some(ip) => ip,
            None => discover_listen_ip(self.ip_family),
        };
        let suspicion = self
            .suspicion
            .unwrap_or(self.heartbeat * SUSPICION_HEARTBEAT_FACTOR as u32);

        let config = ScuttleConfig {
            listen_ip,
            listen_port: self.listen_port,
            heartbeat: self.heartbeat,
            direct_timeout: self.direct_timeout,
            indirect_timeout: self.indirect_timeout,
            indirect_count: self.indirect_count,
            suspicion,
            dead_node_retention_millis: self.dead_node_retention_millis,
            resurrection_period: self.resurrection_period,
            max_broadcast_bytes: self.max_broadcast_bytes,
            max_datagram_bytes: self.max_datagram_bytes,
            ip_family: self.ip_family,
            seed_nodes: self.seed_nodes,
        };
        Self::validate(&config)?;
        Ok(config)
    }
}

fn discover_listen_ip(family: IpFamily) -> IpAddr {
    IpAddress::find_system_ip(family).unwrap_or(match family {
        IpFamily::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpFamily::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
    })
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::BadEnv {
                var: format!("{ENV_PREFIX}{name}"),
                value: raw,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .build()
            .unwrap();
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);
        assert_eq!(config.heartbeat, Duration::from_millis(500));
        assert_eq!(config.suspicion, Duration::from_millis(2_500));
        assert_eq!(config.indirect_count, 3);
        assert_eq!(config.max_datagram_bytes, 512);
        assert_eq!(config.ip_family, IpFamily::V4);
    }

    #[test]
    fn test_suspicion_follows_heartbeat() {
        let config = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .heartbeat(Duration::from_millis(200))
            .build()
            .unwrap();
        assert_eq!(config.suspicion, Duration::from_millis(1_000));
        assert_eq!(config.left_flush_millis(), 800);
    }

    #[test]
    fn test_rejects_zero_values() {
        let result = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .heartbeat(Duration::from_millis(0))
            .build();
        assert!(matches!(result, Err(ConfigError::Zero(_))));

        let result = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .listen_port(0)
            .build();
        assert!(matches!(result, Err(ConfigError::Zero(_))));
    }

    #[test]
    fn test_rejects_family_mismatch() {
        let result = ScuttleConfig::builder()
            .listen_ip("::1")
            .build();
        assert!(matches!(result, Err(ConfigError::FamilyMismatch { .. })));

        let result = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .seed_node("[::1]:9000".parse().unwrap())
            .build();
        assert!(matches!(result, Err(ConfigError::SeedFamilyMismatch { .. })));
    }

    #[test]
    fn test_rejects_broadcast_larger_than_datagram() {
        let result = ScuttleConfig::builder()
            .listen_ip("127.0.0.1")
            .max_datagram_bytes(128)
            .build();
        assert!(matches!(result, Err(ConfigError::BroadcastTooLarge { .. })));
    }
}
