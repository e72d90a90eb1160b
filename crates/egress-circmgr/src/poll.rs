//! Background tasks attached to every circuit: the exit-IP poller and the
//! health heal timer.

use std::sync::{Arc, Weak};
use std::time::Duration;

use egress_daemon::ProcessHost;
use egress_rate::now_ms;
use tracing::{debug, warn};

use crate::circuit::{Circuit, POLL_FAILURE_PENALTY, POLL_HEALTH_BONUS};
use crate::client::{ClientFlavor, EgressClient};
use crate::mgr::EgressMgr;
use crate::Result;

/// How long a poller naps when the manager's gates are busy before looking
/// again.
const GATE_BUSY_RETRY: Duration = Duration::from_secs(1);

/// Attempt cap for one poll round.  Bounding this keeps an indefinitely
/// failing poll from escalating anywhere; it just costs health.
const POLL_ATTEMPTS: u32 = 4;

/// Pause between attempts within one poll round.
const POLL_ATTEMPT_SPACING: Duration = Duration::from_secs(1);

/// Spawn the poller and heal tasks for a freshly added circuit.
pub(crate) fn launch_circuit_tasks<H: ProcessHost>(mgr: &Arc<EgressMgr<H>>, circuit: &Arc<Circuit>) {
    tokio::spawn(poll_loop(Arc::downgrade(mgr), Arc::clone(circuit)));
    tokio::spawn(heal_loop(Arc::clone(circuit)));
}

/// Watch one circuit's exit IP for as long as the circuit is valid.
///
/// Pollers are strictly observers: when the IP moves they tell the manager
/// and never try to rotate anything themselves.
async fn poll_loop<H: ProcessHost>(mgr: Weak<EgressMgr<H>>, circuit: Arc<Circuit>) {
    // The pollster client is bound to this circuit for life; it never
    // rebinds and is invisible to the manager's client list.
    let pollster = EgressClient::new(mgr.clone(), Arc::clone(&circuit), ClientFlavor::Polling);
    while circuit.is_valid() {
        let Some(mgr) = mgr.upgrade() else { break };
        if mgr.gates_busy() {
            // An IP change is in flight; observing now would race it.
            drop(mgr);
            tokio::time::sleep(GATE_BUSY_RETRY).await;
            continue;
        }
        match probe_with_cap(&mgr, &pollster).await {
            Ok(ip) => {
                if circuit.exit_ip().as_deref() != Some(ip.as_str()) {
                    if let Err(e) = mgr.on_observed_ip_change(&circuit, &ip) {
                        warn!(
                            "could not apply observed IP change on {}: {}",
                            circuit.display_id(),
                            e
                        );
                    }
                }
                circuit.stamp_poll(now_ms());
                circuit.promote_health(POLL_HEALTH_BONUS);
            }
            Err(e) => {
                debug!("poll round for {} failed: {}", circuit.display_id(), e);
                circuit.punish_health(POLL_FAILURE_PENALTY);
            }
        }
        drop(mgr);
        tokio::time::sleep(circuit.poll_interval()).await;
    }
    debug!("poller for {} exiting", circuit.display_id());
}

/// One poll round: up to [`POLL_ATTEMPTS`] probe attempts, spaced
/// [`POLL_ATTEMPT_SPACING`] apart.
async fn probe_with_cap<H: ProcessHost>(
    mgr: &EgressMgr<H>,
    pollster: &EgressClient<H>,
) -> Result<String> {
    let conn = pollster.connection();
    let mut last = None;
    for attempt in 1..=POLL_ATTEMPTS {
        match mgr.probe().external_ip(&conn).await {
            Ok(ip) => return Ok(ip),
            Err(e) => last = Some(e),
        }
        if attempt < POLL_ATTEMPTS {
            tokio::time::sleep(POLL_ATTEMPT_SPACING).await;
        }
    }
    Err(last.unwrap_or(crate::Error::Probe {
        detail: "probe never attempted".to_owned(),
    }))
}

/// Top a circuit's health back up on a fixed cadence, for as long as it is
/// valid.
async fn heal_loop(circuit: Arc<Circuit>) {
    loop {
        tokio::time::sleep(circuit.heal_interval()).await;
        if !circuit.is_valid() {
            break;
        }
        circuit.promote_health(circuit.heal_amount());
    }
}
