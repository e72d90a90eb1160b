//! Configuration types for circuits and the egress manager.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use derive_more::Display;
use serde::Deserialize;

/// Poll interval for circuits routed through the local daemon.
///
/// The daemon can change its exit at any moment, so we watch it closely.
pub const DEFAULT_DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Poll interval for ordinary proxy circuits, whose exit IP rarely moves.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// How often a circuit's health is topped up by its heal task.
pub const DEFAULT_HEAL_INTERVAL: Duration = Duration::from_secs(20 * 60);

/// How much health the heal task restores per interval.
pub const DEFAULT_HEAL_AMOUNT: u8 = 10;

/// Default IP-discovery endpoint the probe fetches through a circuit.
pub const DEFAULT_PROBE_URL: &str = "http://localhost/raw_external_ip";

/// Which proxy protocol a circuit speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Deserialize)]
#[non_exhaustive]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    /// SOCKS5 with proxy-side hostname resolution.
    #[display(fmt = "socks5h")]
    Socks5h,
    /// Plain HTTP proxy.
    #[display(fmt = "http")]
    Http,
    /// HTTP proxy over TLS.
    #[display(fmt = "https")]
    Https,
}

/// Definition of one egress circuit, as accepted by
/// [`EgressMgr::add_circuit`](crate::mgr::EgressMgr::add_circuit).
///
/// Only connection coordinates and behavior flags live here; the mutable
/// runtime state (exit IP, health, validity) belongs to the
/// [`Circuit`](crate::circuit::Circuit) built from this definition.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct CircuitConfig {
    /// Host the proxy listens on.
    #[builder(default = "\"0.0.0.0\".to_owned()")]
    pub host: String,

    /// Port the proxy listens on.
    #[builder(default = "9050")]
    pub port: u16,

    /// Optional proxy username.
    #[builder(default)]
    pub username: Option<String>,

    /// Optional proxy password.
    #[builder(default)]
    pub password: Option<String>,

    /// Protocol spoken toward the proxy.
    #[builder(default = "ProxyProtocol::Socks5h")]
    pub protocol: ProxyProtocol,

    /// Optional name; required when `in_cycling_pool` is false.
    #[builder(default)]
    pub name: Option<String>,

    /// Whether this circuit is eligible for random selection.
    #[builder(default = "true")]
    pub in_cycling_pool: bool,

    /// Whether this circuit routes through the supervised local daemon.
    #[builder(default = "false")]
    pub is_local_daemon: bool,

    /// Exit-IP poll interval; when unset, defaulted by circuit kind.
    #[builder(default)]
    #[serde(default, with = "humantime_serde")]
    pub poll_interval: Option<Duration>,

    /// How often health is topped up.
    #[builder(default = "DEFAULT_HEAL_INTERVAL")]
    #[serde(with = "humantime_serde")]
    pub heal_interval: Duration,

    /// How much health each top-up restores.
    #[builder(default = "DEFAULT_HEAL_AMOUNT")]
    pub heal_amount: u8,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            host: "0.0.0.0".to_owned(),
            port: 9050,
            username: None,
            password: None,
            protocol: ProxyProtocol::Socks5h,
            name: None,
            in_cycling_pool: true,
            is_local_daemon: false,
            poll_interval: None,
            heal_interval: DEFAULT_HEAL_INTERVAL,
            heal_amount: DEFAULT_HEAL_AMOUNT,
        }
    }
}

impl CircuitConfig {
    /// Return a new builder.
    pub fn builder() -> CircuitConfigBuilder {
        CircuitConfigBuilder::default()
    }
}

/// Settings for the [`EgressMgr`](crate::mgr::EgressMgr) itself.
#[derive(Debug, Clone, Builder)]
#[non_exhaustive]
pub struct MgrConfig {
    /// Where the persistent rate cache lives.
    ///
    /// Defaults to `proxyratecache-<version>.json` in the working
    /// directory.
    #[builder(default = "PathBuf::from(egress_rate::default_cache_file_name())")]
    pub cache_path: PathBuf,

    /// URL the IP probe fetches through a circuit to learn its exit IP.
    #[builder(default = "DEFAULT_PROBE_URL.to_owned()")]
    pub probe_url: String,
}

impl Default for MgrConfig {
    fn default() -> Self {
        MgrConfig {
            cache_path: PathBuf::from(egress_rate::default_cache_file_name()),
            probe_url: DEFAULT_PROBE_URL.to_owned(),
        }
    }
}

impl MgrConfig {
    /// Return a new builder.
    pub fn builder() -> MgrConfigBuilder {
        MgrConfigBuilder::default()
    }
}
