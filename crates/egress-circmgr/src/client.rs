//! User-facing handles bound to a circuit.

use std::sync::{Arc, Mutex, Weak};

use egress_daemon::ProcessHost;
use tracing::debug;

use crate::circuit::{Circuit, CircuitKind};
use crate::mgr::EgressMgr;
use crate::request::{ProxyConnection, SocksOptions};
use crate::{Error, Result};

/// Which flavor of client this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientFlavor {
    /// An ordinary handle: participates in rotation and rate accounting.
    User,
    /// The hidden per-circuit pollster: bound to its circuit forever, and
    /// excluded from rate-limited operations.
    Polling,
}

/// How a caller names the circuit a new client should bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClientSpec {
    /// Any healthy circuit from the cycling pool.
    Any,
    /// The cycling-pool circuit at this index.
    Index(usize),
    /// The circuit with this name.
    Named(String),
}

impl From<usize> for ClientSpec {
    fn from(i: usize) -> Self {
        ClientSpec::Index(i)
    }
}

impl From<&str> for ClientSpec {
    fn from(name: &str) -> Self {
        ClientSpec::Named(name.to_owned())
    }
}

/// A handle for sending rate-accounted traffic through one circuit.
///
/// Clients do not own their circuit: the manager owns both, and may rebind
/// a client to a different circuit when its current one is removed or
/// rotated away from.
pub struct EgressClient<H: ProcessHost> {
    /// The manager that created us.
    mgr: Weak<EgressMgr<H>>,
    /// The circuit we are currently bound to.
    circuit: Mutex<Arc<Circuit>>,
    /// User or pollster.
    flavor: ClientFlavor,
}

impl<H: ProcessHost> EgressClient<H> {
    /// Make a new client; called only by the manager.
    pub(crate) fn new(
        mgr: Weak<EgressMgr<H>>,
        circuit: Arc<Circuit>,
        flavor: ClientFlavor,
    ) -> Self {
        EgressClient {
            mgr,
            circuit: Mutex::new(circuit),
            flavor,
        }
    }

    /// The circuit this client is currently bound to.
    pub fn circuit(&self) -> Arc<Circuit> {
        Arc::clone(&self.circuit.lock().expect("poisoned lock"))
    }

    /// The exit IP the bound circuit currently presents, if known.
    pub fn current_ip(&self) -> Option<String> {
        self.circuit().exit_ip()
    }

    /// Connection parameters for tagging outbound requests.
    pub fn connection(&self) -> ProxyConnection {
        self.circuit().connection()
    }

    /// SOCKS agent options, when the bound circuit speaks SOCKS.
    pub fn socks_options(&self) -> Option<SocksOptions> {
        self.circuit().socks_options()
    }

    /// True for the hidden per-circuit pollster.
    pub(crate) fn is_polling(&self) -> bool {
        self.flavor == ClientFlavor::Polling
    }

    /// Move this client to a different circuit.  Inert on pollsters, which
    /// stay with their circuit for life.
    pub(crate) fn rebind(&self, circuit: Arc<Circuit>) {
        if self.is_polling() {
            return;
        }
        debug!(
            "rebinding client from {} to {}",
            self.circuit().display_id(),
            circuit.display_id()
        );
        *self.circuit.lock().expect("poisoned lock") = circuit;
    }

    /// Upgrade the manager reference, or fail if it is gone.
    fn mgr(&self) -> Result<Arc<EgressMgr<H>>> {
        self.mgr.upgrade().ok_or(Error::MgrGone)
    }

    /// Move to a different exit, whatever that means for the bound
    /// circuit's kind: tell the daemon to rotate (onion-routed), rebind to
    /// another cycling circuit, or log-and-stay for rigid circuits.
    ///
    /// Returns true if the exit actually changed.  Inert on pollsters.
    pub async fn force_ip_change(&self) -> Result<bool> {
        if self.is_polling() {
            debug!("ignoring force_ip_change on a polling client");
            return Ok(false);
        }
        self.mgr()?.force_change(self).await
    }

    /// If one more `action` through the current exit would stay under its
    /// limit, do nothing; otherwise move to a different exit.
    ///
    /// Returns true when an IP change happened (or was joined).
    pub async fn probe_or_change(&self, action: &str) -> Result<bool> {
        self.check_rate_limited_op()?;
        self.mgr()?.probe_or_change(self, action).await
    }

    /// Record one `action` against whatever exit IP the bound circuit is
    /// presenting right now.
    pub fn report_action(&self, action: &str) -> Result<()> {
        self.check_rate_limited_op()?;
        self.mgr()?.report_action(action, &self.circuit())
    }

    /// Rate-limited operations make no sense on handles that cannot
    /// rotate; using one that way is a caller bug.
    fn check_rate_limited_op(&self) -> Result<()> {
        if self.is_polling() || self.circuit().kind() == CircuitKind::Rigid {
            return Err(Error::RigidCircuitMisuse);
        }
        Ok(())
    }
}
