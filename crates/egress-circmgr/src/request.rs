//! The request-adapter contract: how outbound requests are tagged with a
//! circuit's connection parameters, how transport errors are classified,
//! and how a circuit's exit IP is probed.
//!
//! The HTTP engine itself (and its retry/backoff machinery) lives outside
//! this crate; what is defined here is the policy it consults: which errors
//! are transient, which are suspicious enough to warrant leaving the
//! current exit, and which mean the local daemon needs to be restarted
//! outright.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::circuit::CircuitKind;
use crate::{Error, Result};

/// SOCKS agent options, handed to the transport layer as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct SocksOptions {
    /// SOCKS server host.
    pub socks_host: String,
    /// SOCKS server port.
    pub socks_port: u16,
    /// Optional username.
    pub socks_username: Option<String>,
    /// Optional password.
    pub socks_password: Option<String>,
}

/// Connection parameters attached to every request sent via a client.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProxyConnection {
    /// Route through a SOCKS5 proxy.
    Socks(SocksOptions),
    /// Route through an HTTP(S) proxy at this URL.
    HttpProxy(String),
}

impl ProxyConnection {
    /// Render these parameters as a proxy URL.
    pub fn proxy_url(&self) -> String {
        match self {
            ProxyConnection::Socks(o) => {
                let auth = match (&o.socks_username, &o.socks_password) {
                    (Some(u), Some(p)) => format!("{}:{}@", u, p),
                    (Some(u), None) => format!("{}@", u),
                    _ => String::new(),
                };
                format!("socks5h://{}{}:{}", auth, o.socks_host, o.socks_port)
            }
            ProxyConnection::HttpProxy(url) => url.clone(),
        }
    }
}

/// Error messages that indicate a passing proxy or TLS hiccup.
const TRANSIENT_PROXY_ERRORS: &[&str] = &[
    "socket hang up",
    "SOCKS connection failed. Host unreachable.",
    "SOCKS connection failed. Connection not allowed by ruleset",
    "SSL23_GET_SERVER_HELLO",
    "SSL3_GET_RECORD:wrong version number",
    "SOCKS connection failed. General SOCKS server failure.",
];

/// The transient message that gets the fast-retry treatment.
const HOST_UNREACHABLE: &str = "SOCKS connection failed. Host unreachable.";

/// Error messages that suggest the current exit is interfering with TLS.
const SUSPICIOUS_TLS_ERRORS: &[&str] = &[
    "unable to verify the first certificate",
    "self signed certificate",
    "self signed certificate in certificate chain",
    "Hostname/IP does not match certificate's altnames",
    "SSL3_GET_RECORD:decryption failed or bad record mac",
    "unable to get local issuer certificate",
];

/// The message that, repeated on an onion-routed circuit, means the daemon
/// itself is wedged.
const TTL_EXPIRED: &str = "SOCKS connection failed. TTL expired.";

/// How a failed request should be handled, by error-message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorClass {
    /// Known proxy/TLS flakiness; retry with backoff.
    TransientProxy,
    /// Certificate trouble that smells like the exit, not the target.
    SuspiciousTls,
    /// The onion-routing daemon reported an expired relay path.
    TtlExpired,
    /// Nothing we recognize; leave it to the retry library's defaults.
    Other,
}

/// Classify a transport error message by exact substring.
pub fn classify_error(msg: &str) -> ErrorClass {
    if msg.contains(TTL_EXPIRED) {
        return ErrorClass::TtlExpired;
    }
    if SUSPICIOUS_TLS_ERRORS.iter().any(|p| msg.contains(p)) {
        return ErrorClass::SuspiciousTls;
    }
    if TRANSIENT_PROXY_ERRORS.iter().any(|p| msg.contains(p)) {
        return ErrorClass::TransientProxy;
    }
    ErrorClass::Other
}

/// What the retry library should do about one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
#[non_exhaustive]
pub struct RetryDirective {
    /// Sleep this long before the next attempt; `None` leaves the
    /// library's own backoff in charge.
    pub backoff: Option<Duration>,
    /// Multiply the attempt counter by this factor (partial rewind), when
    /// set.
    pub rewind_attempts: Option<f64>,
    /// Ask the client to move to a different exit before retrying.
    pub force_ip_change: bool,
    /// Kill and respawn the local daemon before surfacing the failure.
    pub force_restart: bool,
}

impl Default for RetryDirective {
    fn default() -> Self {
        RetryDirective {
            backoff: None,
            rewind_attempts: None,
            force_ip_change: false,
            force_restart: false,
        }
    }
}

/// Compute the retry directive for a failed request.
///
/// `attempts` is how many times this request has failed so far, including
/// the current failure; `kind` is the rotation kind of the circuit the
/// request went through.
pub fn retry_directive(msg: &str, attempts: u32, kind: CircuitKind) -> RetryDirective {
    let mut directive = RetryDirective::default();
    match classify_error(msg) {
        ErrorClass::TransientProxy => {
            if msg.contains(HOST_UNREACHABLE) && attempts < 5 {
                // The proxy itself answered; the route beyond it is what is
                // broken.  A fast retry on a different exit usually clears
                // it, and the rewind keeps the attempt budget from
                // expiring on these cheap retries.
                directive.backoff = Some(Duration::from_millis(500));
                directive.rewind_attempts = Some(0.9);
                directive.force_ip_change = true;
            } else if attempts > 5 {
                directive.backoff = Some(Duration::from_secs(180));
                directive.force_ip_change = true;
            } else {
                directive.backoff = Some(Duration::from_secs(60));
            }
        }
        ErrorClass::SuspiciousTls => {
            warn!("suspicious TLS failure through current exit: {}", msg);
            directive.force_ip_change = true;
        }
        ErrorClass::TtlExpired => {
            if kind == CircuitKind::LocalDaemon && attempts > 3 {
                directive.force_restart = true;
            } else {
                directive.backoff = Some(Duration::from_secs(60));
            }
        }
        ErrorClass::Other => {}
    }
    directive
}

/// Matches the first IPv4 dotted quad in a probe response body.
static IPV4_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("invalid IPv4 regex")
});

/// Something that can discover the exit IP a proxy route currently
/// presents.
///
/// The production implementation fetches an IP-echo URL through the route;
/// tests substitute scripted probes.
#[async_trait]
pub trait IpProbe: Send + Sync + 'static {
    /// Return the externally visible IPv4 address when sending through
    /// `conn`.
    async fn external_ip(&self, conn: &ProxyConnection) -> Result<String>;
}

/// [`IpProbe`] that issues a GET to an IP-echo endpoint through the route.
pub struct HttpIpProbe {
    /// URL whose response body contains the caller's IP.
    url: String,
    /// Per-request timeout.
    timeout: Duration,
}

impl HttpIpProbe {
    /// Create a probe against `url`.
    pub fn new(url: &str) -> Self {
        HttpIpProbe {
            url: url.to_owned(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[async_trait]
impl IpProbe for HttpIpProbe {
    async fn external_ip(&self, conn: &ProxyConnection) -> Result<String> {
        let proxy = reqwest::Proxy::all(conn.proxy_url()).map_err(|e| Error::Probe {
            detail: format!("invalid proxy url: {}", e),
        })?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Probe {
                detail: format!("could not build probe client: {}", e),
            })?;
        let body = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::Probe {
                detail: format!("probe request failed: {}", e),
            })?
            .text()
            .await
            .map_err(|e| Error::Probe {
                detail: format!("probe body unreadable: {}", e),
            })?;
        match IPV4_RE.find(&body) {
            Some(m) => {
                let ip = m.as_str().to_owned();
                debug!("probe through {} observed {}", conn.proxy_url(), ip);
                Ok(ip)
            }
            None => Err(Error::Probe {
                detail: "no IPv4 address in probe response".to_owned(),
            }),
        }
    }
}

/// Probe `conn` up to `attempts` times, sleeping a random 10–40 s between
/// failures.
///
/// This is the slow, patient retry used when first learning a circuit's
/// exit; the pollster's fast bounded loop lives with the poller.
pub(crate) async fn probe_with_retries(
    probe: &dyn IpProbe,
    conn: &ProxyConnection,
    attempts: u32,
) -> Result<String> {
    let mut last = None;
    for attempt in 1..=attempts {
        match probe.external_ip(conn).await {
            Ok(ip) => return Ok(ip),
            Err(e) => {
                warn!(
                    "exit-IP probe attempt {}/{} failed: {}",
                    attempt, attempts, e
                );
                last = Some(e);
            }
        }
        if attempt < attempts {
            let backoff = rand::thread_rng().gen_range(10..=40);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
        }
    }
    Err(last.unwrap_or(Error::Probe {
        detail: "probe never attempted".to_owned(),
    }))
}
