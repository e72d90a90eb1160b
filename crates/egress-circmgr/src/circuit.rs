//! A single egress route: its coordinates, its health, and the exit IP it
//! was last observed to present.

use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::config::{
    CircuitConfig, ProxyProtocol, DEFAULT_DAEMON_POLL_INTERVAL, DEFAULT_POLL_INTERVAL,
};
use crate::request::{ProxyConnection, SocksOptions};

/// Upper bound for a circuit's health score.
pub const HEALTH_MAX: u8 = 100;

/// A circuit with health at or below this is not selected for traffic.
pub const HEALTHY_THRESHOLD: u8 = 20;

/// Health restored by every successful exit-IP poll.
pub(crate) const POLL_HEALTH_BONUS: u8 = 10;

/// Health lost when a poll burns through all of its attempts.
pub(crate) const POLL_FAILURE_PENALTY: u8 = 10;

/// The rotation behavior a circuit supports, derived from its flags.
///
/// The three shapes get an explicit behavior table in the manager and the
/// client rather than any inheritance-like trickery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CircuitKind {
    /// Routed through the supervised local daemon; rotation means telling
    /// the daemon to pick a new exit.
    LocalDaemon,
    /// An ordinary cycling-pool circuit; rotation means rebinding the
    /// client to a different circuit.
    Cycling,
    /// A named-only circuit; rigid by configuration, never rotated.
    Rigid,
}

/// Mutable, mutex-guarded portion of a circuit.
#[derive(Debug)]
struct CircuitState {
    /// The externally visible source address last observed through this
    /// circuit, if any.
    exit_ip: Option<String>,
    /// When the exit IP was last confirmed (ms since epoch, comparable
    /// with action timestamps).
    last_poll_ms: u64,
    /// Health score in `[0, HEALTH_MAX]`.
    health: u8,
    /// False once the circuit has been removed.  Never becomes true again.
    valid: bool,
}

/// A single egress route.
///
/// Connection coordinates are immutable after construction; observed state
/// (exit IP, poll time, health, validity) lives behind a mutex so pollers,
/// heal tasks, and the manager can all touch it.
#[derive(Debug)]
pub struct Circuit {
    /// The definition this circuit was created from.
    config: CircuitConfig,
    /// Poll interval, resolved from the config and the circuit kind.
    poll_interval: Duration,
    /// Mutable state.
    state: Mutex<CircuitState>,
}

impl Circuit {
    /// Create a circuit from its definition.  Fresh circuits are valid and
    /// at full health.
    pub(crate) fn new(config: CircuitConfig) -> Self {
        let poll_interval = config.poll_interval.unwrap_or(if config.is_local_daemon {
            DEFAULT_DAEMON_POLL_INTERVAL
        } else {
            DEFAULT_POLL_INTERVAL
        });
        Circuit {
            config,
            poll_interval,
            state: Mutex::new(CircuitState {
                exit_ip: None,
                last_poll_ms: 0,
                health: HEALTH_MAX,
                valid: true,
            }),
        }
    }

    /// Return the identifier string
    /// `<protocol>://[<user>[:<pass>]@]<host>:<port>`.
    ///
    /// Uniqueness in the pool is judged on this string.
    pub fn proxy_id(&self) -> String {
        let auth = match (&self.config.username, &self.config.password) {
            (Some(u), Some(p)) => format!("{}:{}@", u, p),
            (Some(u), None) => format!("{}@", u),
            _ => String::new(),
        };
        format!(
            "{}://{}{}:{}",
            self.config.protocol, auth, self.config.host, self.config.port
        )
    }

    /// Return the display identifier: [`proxy_id`](Self::proxy_id),
    /// prefixed with `"(<name>) "` when the circuit is named.
    pub fn display_id(&self) -> String {
        match &self.config.name {
            Some(name) => format!("({}) {}", name, self.proxy_id()),
            None => self.proxy_id(),
        }
    }

    /// Return this circuit's rotation kind.
    pub fn kind(&self) -> CircuitKind {
        if self.config.is_local_daemon {
            CircuitKind::LocalDaemon
        } else if self.config.in_cycling_pool {
            CircuitKind::Cycling
        } else {
            CircuitKind::Rigid
        }
    }

    /// Return the circuit's name, if any.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// True if this circuit routes through the supervised daemon.
    pub fn is_local_daemon(&self) -> bool {
        self.config.is_local_daemon
    }

    /// True if this circuit is eligible for random selection.
    pub fn in_cycling_pool(&self) -> bool {
        self.config.in_cycling_pool
    }

    /// Return the resolved poll interval.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Return the heal interval.
    pub fn heal_interval(&self) -> Duration {
        self.config.heal_interval
    }

    /// Return the heal amount per interval.
    pub fn heal_amount(&self) -> u8 {
        self.config.heal_amount
    }

    /// Return the exit IP this circuit was last observed to present.
    pub fn exit_ip(&self) -> Option<String> {
        self.state.lock().expect("poisoned lock").exit_ip.clone()
    }

    /// Record a newly confirmed exit IP.
    pub(crate) fn set_exit_ip(&self, ip: &str) {
        self.state.lock().expect("poisoned lock").exit_ip = Some(ip.to_owned());
    }

    /// When the exit IP was last confirmed, in ms since the epoch.
    pub fn last_poll_ms(&self) -> u64 {
        self.state.lock().expect("poisoned lock").last_poll_ms
    }

    /// Stamp the last-confirmed time.
    pub(crate) fn stamp_poll(&self, now_ms: u64) {
        self.state.lock().expect("poisoned lock").last_poll_ms = now_ms;
    }

    /// Current health score.
    pub fn health(&self) -> u8 {
        self.state.lock().expect("poisoned lock").health
    }

    /// True when health is above the selection threshold.
    pub fn healthy(&self) -> bool {
        self.health() > HEALTHY_THRESHOLD
    }

    /// Raise health by `amount`, clamped to [`HEALTH_MAX`].
    pub(crate) fn promote_health(&self, amount: u8) {
        let mut st = self.state.lock().expect("poisoned lock");
        st.health = st.health.saturating_add(amount).min(HEALTH_MAX);
    }

    /// Lower health by `amount`, clamped to zero.
    pub(crate) fn punish_health(&self, amount: u8) {
        let mut st = self.state.lock().expect("poisoned lock");
        st.health = st.health.saturating_sub(amount);
        debug!(
            "circuit {} health degraded to {}",
            self.display_id(),
            st.health
        );
    }

    /// True until the circuit is removed.
    pub fn is_valid(&self) -> bool {
        self.state.lock().expect("poisoned lock").valid
    }

    /// Mark the circuit invalid.  Invalid circuits are never revived;
    /// callers wanting the same route again must create a new circuit.
    pub(crate) fn invalidate(&self) {
        self.state.lock().expect("poisoned lock").valid = false;
    }

    /// Return the connection parameters a request adapter needs to send
    /// traffic through this circuit.
    pub fn connection(&self) -> ProxyConnection {
        match self.config.protocol {
            ProxyProtocol::Socks5h => ProxyConnection::Socks(SocksOptions {
                socks_host: self.config.host.clone(),
                socks_port: self.config.port,
                socks_username: self.config.username.clone(),
                socks_password: self.config.password.clone(),
            }),
            ProxyProtocol::Http | ProxyProtocol::Https => {
                ProxyConnection::HttpProxy(self.proxy_id())
            }
        }
    }

    /// Return SOCKS agent options, when this circuit speaks SOCKS.
    pub fn socks_options(&self) -> Option<SocksOptions> {
        match self.connection() {
            ProxyConnection::Socks(opts) => Some(opts),
            ProxyConnection::HttpProxy(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::CircuitConfigBuilder;

    fn cfg() -> CircuitConfigBuilder {
        CircuitConfigBuilder::default()
    }

    #[test]
    fn proxy_id_formats() {
        let c = Circuit::new(cfg().build().unwrap());
        assert_eq!(c.proxy_id(), "socks5h://0.0.0.0:9050");

        let c = Circuit::new(
            cfg()
                .host("proxy.example.com".to_owned())
                .port(8080)
                .protocol(ProxyProtocol::Http)
                .username(Some("u".to_owned()))
                .password(Some("p".to_owned()))
                .build()
                .unwrap(),
        );
        assert_eq!(c.proxy_id(), "http://u:p@proxy.example.com:8080");

        let c = Circuit::new(
            cfg()
                .username(Some("solo".to_owned()))
                .build()
                .unwrap(),
        );
        assert_eq!(c.proxy_id(), "socks5h://solo@0.0.0.0:9050");
    }

    #[test]
    fn display_id_prefixes_name() {
        let c = Circuit::new(cfg().name(Some("main".to_owned())).build().unwrap());
        assert_eq!(c.display_id(), "(main) socks5h://0.0.0.0:9050");
    }

    #[test]
    fn kind_dispatch() {
        let daemon = Circuit::new(cfg().is_local_daemon(true).build().unwrap());
        assert_eq!(daemon.kind(), CircuitKind::LocalDaemon);
        let cycling = Circuit::new(cfg().build().unwrap());
        assert_eq!(cycling.kind(), CircuitKind::Cycling);
        let rigid = Circuit::new(
            cfg()
                .in_cycling_pool(false)
                .name(Some("rigid".to_owned()))
                .build()
                .unwrap(),
        );
        assert_eq!(rigid.kind(), CircuitKind::Rigid);
    }

    #[test]
    fn poll_interval_defaults_by_kind() {
        let daemon = Circuit::new(cfg().is_local_daemon(true).build().unwrap());
        assert_eq!(daemon.poll_interval(), DEFAULT_DAEMON_POLL_INTERVAL);
        let plain = Circuit::new(cfg().build().unwrap());
        assert_eq!(plain.poll_interval(), DEFAULT_POLL_INTERVAL);
        let explicit = Circuit::new(
            cfg()
                .poll_interval(Some(Duration::from_secs(7)))
                .build()
                .unwrap(),
        );
        assert_eq!(explicit.poll_interval(), Duration::from_secs(7));
    }

    #[test]
    fn health_clamps_and_thresholds() {
        let c = Circuit::new(cfg().build().unwrap());
        assert_eq!(c.health(), HEALTH_MAX);
        c.promote_health(50);
        assert_eq!(c.health(), HEALTH_MAX);
        c.punish_health(90);
        assert_eq!(c.health(), 10);
        assert!(!c.healthy());
        c.punish_health(50);
        assert_eq!(c.health(), 0);
        c.promote_health(21);
        assert!(c.healthy());
    }

    #[test]
    fn invalidation_is_permanent() {
        let c = Circuit::new(cfg().build().unwrap());
        assert!(c.is_valid());
        c.invalidate();
        assert!(!c.is_valid());
    }

    #[test]
    fn socks_options_pass_through() {
        let c = Circuit::new(
            cfg()
                .host("127.0.0.1".to_owned())
                .port(9150)
                .username(Some("u".to_owned()))
                .build()
                .unwrap(),
        );
        let opts = c.socks_options().unwrap();
        assert_eq!(opts.socks_host, "127.0.0.1");
        assert_eq!(opts.socks_port, 9150);
        assert_eq!(opts.socks_username.as_deref(), Some("u"));
        assert_eq!(opts.socks_password, None);

        let http = Circuit::new(cfg().protocol(ProxyProtocol::Http).build().unwrap());
        assert!(http.socks_options().is_none());
    }
}
